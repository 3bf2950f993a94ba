//! Peer identity: opaque peer id and human-friendly display names.

use std::fmt;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Opaque, stable peer identifier. Locally generated ids are UUID v4 strings;
/// ids received from the network are taken as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

const ADJECTIVES: &[&str] = &[
    "Happy", "Lucky", "Clever", "Brave", "Calm", "Eager", "Graceful", "Lovely", "Mystic", "Lively",
];

const ANIMALS: &[&str] = &[
    "Panda", "Tiger", "Lion", "Eagle", "Dolphin", "Fox", "Wolf", "Bear", "Koala", "Penguin",
    "Kitten", "Puppy",
];

/// Random two-word display name such as "Calm Koala".
pub fn random_display_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Quiet");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("Otter");
    format!("{adjective} {animal}")
}

/// Local identity: id plus the name announced in presence envelopes.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: PeerId,
    pub display_name: String,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            id: PeerId::generate(),
            display_name: random_display_name(),
        }
    }

    pub fn with_name(display_name: impl Into<String>) -> Self {
        Self {
            id: PeerId::generate(),
            display_name: display_name.into(),
        }
    }
}
