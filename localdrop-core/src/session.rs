//! Direct session capability consumed by the connection manager and the
//! transfer engine.
//!
//! A session is a reliable, ordered, message-oriented link to one peer that is
//! negotiated with an offer/answer/candidate exchange. Implementations report
//! everything that happens on the link as [`SessionEvent`]s through the
//! [`SessionEvents`] sink handed to [`SessionFactory::open_session`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::identity::PeerId;

/// Offer or answer, in the JSON shape browsers use (`{type, sdp}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate (`RTCIceCandidateInit` JSON shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl SessionState {
    /// Disconnected, failed and closed sessions are never reused.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Disconnected | SessionState::Failed | SessionState::Closed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::New => "new",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Identifies a data channel within one session.
pub type ChannelId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(s) => s.len(),
            ChannelMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a session reports asynchronously.
pub enum SessionEvent {
    StateChanged(SessionState),
    LocalCandidate(IceCandidate),
    /// The remote side opened a channel on this session.
    IncomingChannel(Arc<dyn DataChannel>),
    ChannelOpen(ChannelId),
    Message {
        channel: ChannelId,
        message: ChannelMessage,
    },
    /// Buffered amount of the channel dropped below its low threshold.
    BufferedAmountLow(ChannelId),
    ChannelClosed(ChannelId),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::StateChanged(s) => write!(f, "StateChanged({s})"),
            SessionEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
            SessionEvent::IncomingChannel(c) => write!(f, "IncomingChannel({})", c.id()),
            SessionEvent::ChannelOpen(id) => write!(f, "ChannelOpen({id})"),
            SessionEvent::Message { channel, message } => {
                write!(f, "Message({channel}, {} bytes)", message.len())
            }
            SessionEvent::BufferedAmountLow(id) => write!(f, "BufferedAmountLow({id})"),
            SessionEvent::ChannelClosed(id) => write!(f, "ChannelClosed({id})"),
        }
    }
}

/// Event tagged with the peer and the session generation it came from.
#[derive(Debug)]
pub struct TaggedSessionEvent {
    pub peer: PeerId,
    pub session_id: u64,
    pub event: SessionEvent,
}

/// Sink a session uses to report events. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    peer: PeerId,
    session_id: u64,
    tx: mpsc::UnboundedSender<TaggedSessionEvent>,
}

impl SessionEvents {
    pub fn new(
        peer: PeerId,
        session_id: u64,
        tx: mpsc::UnboundedSender<TaggedSessionEvent>,
    ) -> Self {
        Self {
            peer,
            session_id,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Returns false once the node has stopped listening.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx
            .send(TaggedSessionEvent {
                peer: self.peer.clone(),
                session_id: self.session_id,
                event,
            })
            .is_ok()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("channel not open")]
    ChannelNotOpen,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// One logical stream inside a session.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Bytes handed to `send` but not yet accepted by the network layer.
    fn buffered_amount(&self) -> usize;
    fn set_buffered_amount_low_threshold(&self, threshold: usize);
    async fn send(&self, message: ChannelMessage) -> Result<(), SessionError>;
    async fn close(&self);
}

#[async_trait]
pub trait Session: Send + Sync {
    fn state(&self) -> SessionState;
    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, SessionError>;
    /// Create an answer for the current remote offer and install it locally.
    async fn create_answer(&self) -> Result<SessionDescription, SessionError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError>;
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, SessionError>;
    async fn close(&self);
}

/// Creates sessions towards peers.
pub trait SessionFactory: Send + Sync {
    fn open_session(
        &self,
        peer: &PeerId,
        events: SessionEvents,
    ) -> Result<Arc<dyn Session>, SessionError>;
}
