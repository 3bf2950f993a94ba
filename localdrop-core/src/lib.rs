//! LocalDrop core: presence, signaling, connection management and chunked
//! transfers between peers in the same room.
//! Transport-agnostic: the host supplies pub/sub, sessions and persistence.

pub mod config;
pub mod identity;
pub mod protocol;
pub mod rendezvous;
pub mod wire;

pub mod chunk;
pub mod connection;
pub mod persist;
pub mod presence;
pub mod session;
pub mod signaling;
pub mod transfer;

pub mod core;
pub mod memory;

pub use config::{ConfigError, NodeConfig};
pub use core::{Collaborators, Node, NodeError, NodeEvent, NodeHandle, CHANNEL_LABEL};
pub use identity::{Identity, PeerId};
pub use persist::{PersistError, Persistence, SavedFile};
pub use presence::{find_peer, PeerSummary};
pub use rendezvous::{PubSub, RendezvousError, RendezvousMessage};
pub use session::{
    ChannelId, ChannelMessage, DataChannel, IceCandidate, SdpKind, Session, SessionDescription,
    SessionError, SessionEvent, SessionEvents, SessionFactory, SessionState,
};
pub use transfer::{Direction, TransferError, TransferId, TransferOutcome};
