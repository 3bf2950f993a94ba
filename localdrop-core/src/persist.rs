//! Persistence capability: where received files end up.

use async_trait::async_trait;

/// Where a received item was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    /// Path or other human-readable location.
    pub location: String,
    pub size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("refused to save {name}: {reason}")]
    Rejected { name: String, reason: String },
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save(&self, bytes: Vec<u8>, name: &str, mime: &str)
        -> Result<SavedFile, PersistError>;
}

/// Reduce an untrusted file name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .find(|s| !s.trim().is_empty())
        .unwrap_or("");
    let cleaned: String = last
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "received".to_string()
    } else {
        cleaned
    }
}
