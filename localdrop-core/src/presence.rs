//! Presence registry: peers seen on the room broadcast and their liveness.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::identity::{Identity, PeerId};
use crate::protocol::Envelope;

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub last_seen: Instant,
}

/// Snapshot entry handed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub id: PeerId,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceUpdate {
    Joined,
    Refreshed,
    /// Self-echo or not a presence envelope.
    Ignored,
}

pub struct PresenceRegistry {
    me: Identity,
    liveness_window: Duration,
    peers: HashMap<PeerId, Peer>,
}

impl PresenceRegistry {
    pub fn new(me: Identity, liveness_window: Duration) -> Self {
        Self {
            me,
            liveness_window,
            peers: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.me.id
    }

    /// Presence envelope for the room broadcast.
    pub fn announce(&self) -> Envelope {
        Envelope::Presence {
            sender: Some(self.me.id.clone()),
            id: self.me.id.clone(),
            name: self.me.display_name.clone(),
            timestamp: unix_millis(),
        }
    }

    /// Upsert the sender of a presence envelope with a fresh last-seen time.
    pub fn on_presence(&mut self, env: &Envelope, now: Instant) -> PresenceUpdate {
        let Envelope::Presence { id, name, .. } = env else {
            return PresenceUpdate::Ignored;
        };
        if *id == self.me.id || *env.sender() == self.me.id {
            return PresenceUpdate::Ignored;
        }
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.last_seen = now;
                if peer.display_name != *name {
                    peer.display_name = name.clone();
                }
                PresenceUpdate::Refreshed
            }
            None => {
                self.peers.insert(
                    id.clone(),
                    Peer {
                        id: id.clone(),
                        display_name: name.clone(),
                        last_seen: now,
                    },
                );
                PresenceUpdate::Joined
            }
        }
    }

    /// Remove peers whose silence exceeds the liveness window. Returns the
    /// evicted ids.
    pub fn prune(&mut self, now: Instant) -> Vec<PeerId> {
        let window = self.liveness_window;
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > window)
            .map(|p| p.id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn display_name(&self, id: &PeerId) -> Option<&str> {
        self.peers.get(id).map(|p| p.display_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Current peers sorted by display name, then id.
    pub fn peers(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self
            .peers
            .values()
            .map(|p| PeerSummary {
                id: p.id.clone(),
                display_name: p.display_name.clone(),
            })
            .collect();
        out.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }
}

/// Resolve a user-supplied peer reference: exact id, unique id prefix, or
/// case-insensitive display name.
pub fn find_peer<'a>(peers: &'a [PeerSummary], query: &str) -> Option<&'a PeerSummary> {
    if let Some(p) = peers.iter().find(|p| p.id.as_str() == query) {
        return Some(p);
    }
    let by_prefix: Vec<&PeerSummary> = peers
        .iter()
        .filter(|p| !query.is_empty() && p.id.as_str().starts_with(query))
        .collect();
    if by_prefix.len() == 1 {
        return Some(by_prefix[0]);
    }
    peers
        .iter()
        .find(|p| p.display_name.eq_ignore_ascii_case(query))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
