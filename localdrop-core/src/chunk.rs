//! Chunking: split an outbound payload into fixed-size chunks, reassemble
//! inbound chunks against a declared size.

use std::io;
use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Where the bytes of an outbound item come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    Memory(Vec<u8>),
    Path(PathBuf),
}

enum Source {
    Memory { data: Vec<u8>, pos: usize },
    File(File),
}

/// Reads a payload incrementally, one chunk at a time.
pub struct ChunkReader {
    source: Source,
    chunk_size: usize,
    total: u64,
    remaining: u64,
}

impl ChunkReader {
    pub async fn open(source: PayloadSource, chunk_size: usize) -> io::Result<Self> {
        let chunk_size = chunk_size.max(1);
        let (source, total) = match source {
            PayloadSource::Memory(data) => {
                let total = data.len() as u64;
                (Source::Memory { data, pos: 0 }, total)
            }
            PayloadSource::Path(path) => {
                let file = File::open(&path).await?;
                let meta = file.metadata().await?;
                if !meta.is_file() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} is not a regular file", path.display()),
                    ));
                }
                (Source::File(file), meta.len())
            }
        };
        Ok(Self {
            source,
            chunk_size,
            total,
            remaining: total,
        })
    }

    /// Size declared in the metadata frame.
    pub fn total_len(&self) -> u64 {
        self.total
    }

    /// Next chunk, or `None` once the declared size has been read. A file
    /// that shrinks while being read yields `UnexpectedEof`.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = (self.chunk_size as u64).min(self.remaining) as usize;
        let chunk = match &mut self.source {
            Source::Memory { data, pos } => {
                let chunk = data[*pos..*pos + want].to_vec();
                *pos += want;
                chunk
            }
            Source::File(file) => {
                let mut buf = vec![0u8; want];
                file.read_exact(&mut buf).await?;
                buf
            }
        };
        self.remaining -= want as u64;
        Ok(Some(chunk))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("received {received} bytes, more than the declared {expected}")]
    Overflow { expected: u64, received: u64 },
}

/// Accumulates inbound chunks, merging them into blocks of `threshold`
/// bytes so that a large file is not held as thousands of small buffers.
pub struct ChunkAssembler {
    expected: u64,
    received: u64,
    threshold: usize,
    blocks: Vec<Vec<u8>>,
    current: Vec<u8>,
}

impl ChunkAssembler {
    pub fn new(expected: u64, threshold: usize) -> Self {
        Self {
            expected,
            received: 0,
            threshold: threshold.max(1),
            blocks: Vec::new(),
            current: Vec::new(),
        }
    }

    /// Append a chunk. Returns true once the declared size is reached.
    pub fn push(&mut self, chunk: &[u8]) -> Result<bool, AssembleError> {
        let received = self.received + chunk.len() as u64;
        if received > self.expected {
            return Err(AssembleError::Overflow {
                expected: self.expected,
                received,
            });
        }
        self.current.extend_from_slice(chunk);
        self.received = received;
        if self.current.len() >= self.threshold {
            self.blocks.push(std::mem::take(&mut self.current));
        }
        Ok(self.is_complete())
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.expected
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Concatenate everything received so far.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.received as usize);
        for block in self.blocks {
            out.extend_from_slice(&block);
        }
        out.extend_from_slice(&self.current);
        out
    }
}
