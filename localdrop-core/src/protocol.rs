//! LocalDrop wire protocol: rendezvous envelopes, in-band stream frames and
//! topic layout.

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::session::{ChannelId, IceCandidate, SessionDescription};

/// Namespace for every rendezvous topic.
pub const TOPIC_PREFIX: &str = "localdrop/v1";

/// Topic for presence envelopes of a room.
pub fn broadcast_topic(room: &str) -> String {
    format!("{TOPIC_PREFIX}/{room}/broadcast")
}

/// Topic carrying signaling addressed to `peer`.
pub fn peer_topic(room: &str, peer: &PeerId) -> String {
    format!("{TOPIC_PREFIX}/{room}/{peer}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    File,
    Text,
}

/// File summary carried in offers (`fileInfo`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferFileInfo {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
}

/// Unit exchanged over the rendezvous channel. Flat JSON with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Presence {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<PeerId>,
        id: PeerId,
        name: String,
        timestamp: u64,
    },
    Offer {
        sender: PeerId,
        target: PeerId,
        sdp: SessionDescription,
        #[serde(
            rename = "transferType",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        transfer_type: Option<TransferKind>,
        #[serde(rename = "fileInfo", default, skip_serializing_if = "Option::is_none")]
        file_info: Option<OfferFileInfo>,
    },
    Answer {
        sender: PeerId,
        target: PeerId,
        sdp: SessionDescription,
    },
    Candidate {
        sender: PeerId,
        target: PeerId,
        candidate: IceCandidate,
    },
    TransferComplete {
        sender: PeerId,
        target: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Data channel the finished stream arrived on.
        #[serde(rename = "channelId", default, skip_serializing_if = "Option::is_none")]
        channel: Option<ChannelId>,
    },
}

impl Envelope {
    /// Originating peer. Presence envelopes without `sender` are attributed to `id`.
    pub fn sender(&self) -> &PeerId {
        match self {
            Envelope::Presence { sender, id, .. } => sender.as_ref().unwrap_or(id),
            Envelope::Offer { sender, .. }
            | Envelope::Answer { sender, .. }
            | Envelope::Candidate { sender, .. }
            | Envelope::TransferComplete { sender, .. } => sender,
        }
    }

    /// Addressed peer; `None` for presence.
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            Envelope::Presence { .. } => None,
            Envelope::Offer { target, .. }
            | Envelope::Answer { target, .. }
            | Envelope::Candidate { target, .. }
            | Envelope::TransferComplete { target, .. } => Some(target),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Presence { .. } => "presence",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::Candidate { .. } => "candidate",
            Envelope::TransferComplete { .. } => "transfer-complete",
        }
    }
}

/// Metadata frame: first message of a file stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    #[serde(rename = "fileType", default)]
    pub file_type: String,
    #[serde(rename = "batchIndex", default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<u32>,
    #[serde(rename = "batchTotal", default, skip_serializing_if = "Option::is_none")]
    pub batch_total: Option<u32>,
}

/// JSON text frames carried on a data channel. File bytes travel as binary
/// messages and never appear here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamFrame {
    FileInfo(FileInfo),
    AckTransfer,
    Text { content: String },
}
