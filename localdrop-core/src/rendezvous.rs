//! Rendezvous channel: room-scoped publish/subscribe used for presence and
//! signaling. File bytes never travel here.

use std::sync::Arc;

use async_trait::async_trait;

use crate::identity::PeerId;
use crate::protocol;

/// One message delivered by the publish/subscribe transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("room id is empty")]
    EmptyRoom,
    #[error("publish/subscribe transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Publish/subscribe transport. Inbound messages for subscribed topics are
/// delivered out of band (an mpsc receiver handed to the node).
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), RendezvousError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), RendezvousError>;
}

/// Replace characters that would change the topic structure.
pub fn sanitize_room(room: &str) -> Result<String, RendezvousError> {
    let room: String = room
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if room.is_empty() {
        return Err(RendezvousError::EmptyRoom);
    }
    Ok(room)
}

pub struct RendezvousChannel {
    room: String,
    self_id: PeerId,
    transport: Arc<dyn PubSub>,
}

impl RendezvousChannel {
    pub fn new(
        room: &str,
        self_id: PeerId,
        transport: Arc<dyn PubSub>,
    ) -> Result<Self, RendezvousError> {
        Ok(Self {
            room: sanitize_room(room)?,
            self_id,
            transport,
        })
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn broadcast_topic(&self) -> String {
        protocol::broadcast_topic(&self.room)
    }

    pub fn own_topic(&self) -> String {
        protocol::peer_topic(&self.room, &self.self_id)
    }

    /// Subscribe to the room broadcast and to our own signaling topic.
    pub async fn join(&self) -> Result<(), RendezvousError> {
        self.transport.subscribe(&self.broadcast_topic()).await?;
        self.transport.subscribe(&self.own_topic()).await
    }

    pub async fn publish_presence(&self, payload: Vec<u8>) -> Result<(), RendezvousError> {
        self.transport
            .publish(&self.broadcast_topic(), payload)
            .await
    }

    pub async fn publish_to(
        &self,
        target: &PeerId,
        payload: Vec<u8>,
    ) -> Result<(), RendezvousError> {
        self.transport
            .publish(&protocol::peer_topic(&self.room, target), payload)
            .await
    }
}
