//! Signaling relay: addresses negotiation envelopes to exactly one peer and
//! dispatches inbound envelopes by kind.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::identity::PeerId;
use crate::protocol::{Envelope, OfferFileInfo, TransferKind};
use crate::rendezvous::{RendezvousChannel, RendezvousError};
use crate::session::{ChannelId, IceCandidate, SessionDescription};
use crate::wire::{self, WireError};

/// Payload of a peer-addressed envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer {
        sdp: SessionDescription,
        transfer_type: Option<TransferKind>,
        file_info: Option<OfferFileInfo>,
    },
    Answer {
        sdp: SessionDescription,
    },
    Candidate(IceCandidate),
    TransferComplete {
        name: Option<String>,
        channel: Option<ChannelId>,
    },
}

impl Signal {
    fn into_envelope(self, sender: PeerId, target: PeerId) -> Envelope {
        match self {
            Signal::Offer {
                sdp,
                transfer_type,
                file_info,
            } => Envelope::Offer {
                sender,
                target,
                sdp,
                transfer_type,
                file_info,
            },
            Signal::Answer { sdp } => Envelope::Answer {
                sender,
                target,
                sdp,
            },
            Signal::Candidate(candidate) => Envelope::Candidate {
                sender,
                target,
                candidate,
            },
            Signal::TransferComplete { name, channel } => Envelope::TransferComplete {
                sender,
                target,
                name,
                channel,
            },
        }
    }
}

/// Result of dispatching one inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Presence(Envelope),
    Signal { from: PeerId, signal: Signal },
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
}

pub struct SignalingRelay {
    self_id: PeerId,
    channel: Arc<RendezvousChannel>,
}

impl SignalingRelay {
    pub fn new(self_id: PeerId, channel: Arc<RendezvousChannel>) -> Self {
        Self { self_id, channel }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// Stamp `signal` with our id and publish it on the target's topic.
    pub async fn send(&self, target: &PeerId, signal: Signal) -> Result<(), SignalingError> {
        let env = signal.into_envelope(self.self_id.clone(), target.clone());
        let kind = env.kind();
        let bytes = wire::encode_envelope(&env)?;
        self.channel.publish_to(target, bytes).await?;
        debug!(peer = %target.short(), kind, "signal sent");
        Ok(())
    }

    /// Parse and route one raw envelope. Malformed, self-originated and
    /// foreign-addressed envelopes yield `None`.
    pub fn on_envelope(&self, raw: &[u8]) -> Option<Inbound> {
        let env = match wire::decode_envelope(raw) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "dropping malformed envelope");
                return None;
            }
        };
        if *env.sender() == self.self_id {
            return None;
        }
        if let Envelope::Presence { .. } = env {
            return Some(Inbound::Presence(env));
        }
        if env.target() != Some(&self.self_id) {
            debug!(kind = env.kind(), "envelope for another peer ignored");
            return None;
        }
        let from = env.sender().clone();
        let signal = match env {
            Envelope::Offer {
                sdp,
                transfer_type,
                file_info,
                ..
            } => Signal::Offer {
                sdp,
                transfer_type,
                file_info,
            },
            Envelope::Answer { sdp, .. } => Signal::Answer { sdp },
            Envelope::Candidate { candidate, .. } => Signal::Candidate(candidate),
            Envelope::TransferComplete { name, channel, .. } => {
                Signal::TransferComplete { name, channel }
            }
            Envelope::Presence { .. } => return None,
        };
        Some(Inbound::Signal { from, signal })
    }
}
