//! Received files go to the download directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use localdrop_core::persist::sanitize_file_name;
use localdrop_core::{PersistError, Persistence, SavedFile};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub struct FsPersistence {
    candidates: Vec<PathBuf>,
}

impl FsPersistence {
    /// Try `configured`, then `$HOME/Downloads`, then the current directory.
    pub fn new(configured: Option<PathBuf>) -> Self {
        let mut candidates = Vec::new();
        candidates.extend(configured);
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join("Downloads"));
        }
        candidates.push(PathBuf::from("."));
        Self { candidates }
    }
}

/// `name`, then `stem (1).ext`, `stem (2).ext`, ...
fn numbered(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}

/// Write into `dir` under the first free numbered variant of `name`.
async fn save_in(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let mut n = 0;
    loop {
        let path = dir.join(numbered(name, n));
        let open = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match open {
            Ok(mut file) => {
                file.write_all(bytes).await?;
                file.flush().await?;
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl Persistence for FsPersistence {
    async fn save(
        &self,
        bytes: Vec<u8>,
        name: &str,
        mime: &str,
    ) -> Result<SavedFile, PersistError> {
        let name = sanitize_file_name(name);
        let mut last = None;
        for dir in &self.candidates {
            match save_in(dir, &name, &bytes).await {
                Ok(path) => {
                    debug!(path = %path.display(), mime, "saved");
                    return Ok(SavedFile {
                        location: path.display().to_string(),
                        size: bytes.len() as u64,
                    });
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "cannot save here, trying next directory");
                    last = Some(e);
                }
            }
        }
        Err(match last {
            Some(e) => PersistError::Io(e),
            None => PersistError::Rejected {
                name,
                reason: "no download directory".into(),
            },
        })
    }
}
