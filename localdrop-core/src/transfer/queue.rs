//! Outbound FIFO items.

use std::path::{Path, PathBuf};

use crate::chunk::PayloadSource;
use crate::identity::PeerId;
use crate::protocol::TransferKind;
use crate::transfer::{TransferId, TransferIds};

/// File name used when text is too long to travel inline.
pub const LONG_TEXT_NAME: &str = "message.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    File {
        name: String,
        mime_type: String,
        source: PayloadSource,
    },
}

impl Payload {
    pub fn kind(&self) -> TransferKind {
        match self {
            Payload::Text(_) => TransferKind::Text,
            Payload::File { .. } => TransferKind::File,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Payload::Text(_) => "text",
            Payload::File { name, .. } => name,
        }
    }

    /// File described by a path; name and mime type derived from it.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Payload::File {
            name,
            mime_type: guess_mime(&path),
            source: PayloadSource::Path(path),
        }
    }

    /// Text message; texts longer than `inline_limit` bytes become a
    /// `text/plain` file item.
    pub fn text(content: String, inline_limit: usize) -> Self {
        if content.len() <= inline_limit {
            return Payload::Text(content);
        }
        Payload::File {
            name: LONG_TEXT_NAME.to_string(),
            mime_type: "text/plain".to_string(),
            source: PayloadSource::Memory(content.into_bytes()),
        }
    }
}

pub fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendQueueItem {
    pub id: TransferId,
    pub target: PeerId,
    pub payload: Payload,
    pub batch_index: Option<u32>,
    pub batch_total: Option<u32>,
}

impl SendQueueItem {
    pub fn single(id: TransferId, target: PeerId, payload: Payload) -> Self {
        Self {
            id,
            target,
            payload,
            batch_index: None,
            batch_total: None,
        }
    }

    /// Items for a batch to one target, numbered from 1.
    pub fn batch(ids: &TransferIds, target: &PeerId, payloads: Vec<Payload>) -> Vec<Self> {
        let total = payloads.len() as u32;
        payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| Self {
                id: ids.next(),
                target: target.clone(),
                payload,
                batch_index: Some(i as u32 + 1),
                batch_total: Some(total),
            })
            .collect()
    }
}
