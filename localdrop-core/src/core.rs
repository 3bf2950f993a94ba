//! Node: one cooperative task owning presence, signaling, connections and
//! inbound streams, plus the sender worker draining the send queue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::connection::ConnectionManager;
use crate::identity::{Identity, PeerId};
use crate::persist::Persistence;
use crate::presence::{PeerSummary, PresenceRegistry, PresenceUpdate};
use crate::rendezvous::{PubSub, RendezvousChannel, RendezvousError, RendezvousMessage};
use crate::protocol::TransferKind;
use crate::session::{
    ChannelMessage, SessionEvent, SessionFactory, SessionState, TaggedSessionEvent,
};
use crate::signaling::{Inbound, Signal, SignalingRelay};
use crate::transfer::queue::{Payload, SendQueueItem};
use crate::transfer::receiver::InboundStreams;
use crate::transfer::sender::{OpenRequest, OutboundStream, SenderWorker, StreamEvent};
use crate::transfer::{
    Direction, StreamKey, Transfer, TransferError, TransferId, TransferIds, TransferOutcome,
};
use crate::wire;

/// Label of every data channel the node opens.
pub const CHANNEL_LABEL: &str = "localdrop";

/// Observer notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    PeersChanged(Vec<PeerSummary>),
    TransferStarted {
        id: TransferId,
        peer: PeerId,
        name: String,
        size: u64,
        direction: Direction,
        batch_index: Option<u32>,
        batch_total: Option<u32>,
    },
    TransferProgress {
        id: TransferId,
        direction: Direction,
        current: u64,
        total: u64,
    },
    TransferFinished {
        id: TransferId,
        peer: PeerId,
        name: String,
        direction: Direction,
        outcome: TransferOutcome,
    },
    TextReceived {
        peer: PeerId,
        content: String,
    },
}

impl NodeEvent {
    pub(crate) fn started(t: &Transfer) -> Self {
        NodeEvent::TransferStarted {
            id: t.id,
            peer: t.peer.clone(),
            name: t.name.clone(),
            size: t.total_size,
            direction: t.direction,
            batch_index: t.batch_index,
            batch_total: t.batch_total,
        }
    }

    pub(crate) fn progress(t: &Transfer) -> Self {
        NodeEvent::TransferProgress {
            id: t.id,
            direction: t.direction,
            current: t.bytes_transferred(),
            total: t.total_size,
        }
    }

    pub(crate) fn finished(t: &Transfer, outcome: TransferOutcome) -> Self {
        NodeEvent::TransferFinished {
            id: t.id,
            peer: t.peer.clone(),
            name: t.name.clone(),
            direction: t.direction,
            outcome,
        }
    }
}

/// External capabilities the node runs on.
pub struct Collaborators {
    pub pubsub: Arc<dyn PubSub>,
    /// Messages for topics the node subscribed to.
    pub inbox: mpsc::UnboundedReceiver<RendezvousMessage>,
    pub sessions: Arc<dyn SessionFactory>,
    pub persistence: Arc<dyn Persistence>,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    #[error("node stopped")]
    Stopped,
}

pub(crate) enum Command {
    OpenStream {
        request: OpenRequest,
        reply: oneshot::Sender<Result<OutboundStream, TransferError>>,
    },
    CloseStream(StreamKey),
    Peers(oneshot::Sender<Vec<PeerSummary>>),
    Disconnect {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable control surface of a running node.
#[derive(Clone)]
pub struct NodeHandle {
    self_id: PeerId,
    room: String,
    commands: mpsc::UnboundedSender<Command>,
    queue: mpsc::UnboundedSender<SendQueueItem>,
    ids: TransferIds,
    text_inline_limit: usize,
}

impl NodeHandle {
    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Queue one file.
    pub fn send_file(
        &self,
        target: &PeerId,
        path: impl Into<PathBuf>,
    ) -> Result<TransferId, NodeError> {
        let item = SendQueueItem::single(self.ids.next(), target.clone(), Payload::from_path(path));
        self.enqueue(item)
    }

    /// Queue several files for one target as a numbered batch.
    pub fn send_files(
        &self,
        target: &PeerId,
        paths: Vec<PathBuf>,
    ) -> Result<Vec<TransferId>, NodeError> {
        let payloads = paths.into_iter().map(Payload::from_path).collect();
        SendQueueItem::batch(&self.ids, target, payloads)
            .into_iter()
            .map(|item| self.enqueue(item))
            .collect()
    }

    /// Queue in-memory bytes as a file item.
    pub fn send_bytes(
        &self,
        target: &PeerId,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<TransferId, NodeError> {
        let payload = Payload::File {
            name: name.into(),
            mime_type: mime_type.into(),
            source: crate::chunk::PayloadSource::Memory(bytes),
        };
        self.enqueue(SendQueueItem::single(self.ids.next(), target.clone(), payload))
    }

    pub fn send_text(
        &self,
        target: &PeerId,
        text: impl Into<String>,
    ) -> Result<TransferId, NodeError> {
        let payload = Payload::text(text.into(), self.text_inline_limit);
        self.enqueue(SendQueueItem::single(self.ids.next(), target.clone(), payload))
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Peers(tx))?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Close the connection to `peer`. Returns false if there was none.
    pub async fn disconnect(&self, peer: &PeerId) -> Result<bool, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Disconnect {
            peer: peer.clone(),
            reply,
        })?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Stop the node and wait until its connections are closed.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Shutdown(tx))?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    fn enqueue(&self, item: SendQueueItem) -> Result<TransferId, NodeError> {
        let id = item.id;
        self.queue.send(item).map_err(|_| NodeError::Stopped)?;
        Ok(id)
    }

    fn command(&self, command: Command) -> Result<(), NodeError> {
        self.commands.send(command).map_err(|_| NodeError::Stopped)
    }
}

/// Where events for one sending stream go.
struct OutboundRoute {
    name: String,
    kind: TransferKind,
    events: mpsc::UnboundedSender<StreamEvent>,
}

pub struct Node {
    config: NodeConfig,
    registry: PresenceRegistry,
    channel: Arc<RendezvousChannel>,
    relay: Arc<SignalingRelay>,
    connections: ConnectionManager,
    inbound: InboundStreams,
    outbound: HashMap<StreamKey, OutboundRoute>,
    events: mpsc::UnboundedSender<NodeEvent>,
    inbox: mpsc::UnboundedReceiver<RendezvousMessage>,
    session_events: mpsc::UnboundedReceiver<TaggedSessionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Join `room`, then spawn the node task and the sender worker.
    pub async fn start(
        identity: Identity,
        room: &str,
        config: NodeConfig,
        collaborators: Collaborators,
    ) -> Result<(NodeHandle, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        config.validate()?;
        let Collaborators {
            pubsub,
            inbox,
            sessions,
            persistence,
        } = collaborators;
        let channel = Arc::new(RendezvousChannel::new(room, identity.id.clone(), pubsub)?);
        channel.join().await?;
        let relay = Arc::new(SignalingRelay::new(identity.id.clone(), channel.clone()));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ids = TransferIds::default();

        info!(
            peer = %identity.id.short(),
            name = %identity.display_name,
            room = channel.room(),
            "node starting"
        );
        let handle = NodeHandle {
            self_id: identity.id.clone(),
            room: channel.room().to_string(),
            commands: command_tx.clone(),
            queue: queue_tx,
            ids: ids.clone(),
            text_inline_limit: config.text_inline_limit,
        };
        let inbound = InboundStreams::new(
            relay.clone(),
            persistence,
            events_tx.clone(),
            ids,
            config.consolidate_threshold,
            config.progress_interval,
        );
        let worker = SenderWorker::new(
            config.clone(),
            command_tx,
            events_tx.clone(),
            queue_rx,
            shutdown_rx,
        );
        let node = Node {
            registry: PresenceRegistry::new(identity, config.liveness_window),
            connections: ConnectionManager::new(handle.self_id.clone(), sessions, session_tx),
            config,
            channel,
            relay,
            inbound,
            outbound: HashMap::new(),
            events: events_tx,
            inbox,
            session_events: session_rx,
            commands: command_rx,
            shutdown: shutdown_tx,
        };
        tokio::spawn(worker.run());
        tokio::spawn(node.run());
        Ok((handle, events_rx))
    }

    async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let prune_every = self.config.prune_interval;
        let mut prune = interval_at(Instant::now() + prune_every, prune_every);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let ack = loop {
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.on_rendezvous(msg).await,
                    None => {
                        warn!("rendezvous transport closed");
                        break None;
                    }
                },
                Some(event) = self.session_events.recv() => self.on_session_event(event).await,
                saved = self.inbound.next_saved() => self.inbound.on_saved(saved).await,
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => break Some(ack),
                    Some(command) => self.on_command(command).await,
                    None => break None,
                },
                _ = heartbeat.tick() => self.announce().await,
                _ = prune.tick() => self.prune(),
            }
        };
        self.stop().await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    async fn stop(&mut self) {
        info!("node stopping");
        let _ = self.shutdown.send(true);
        self.outbound.clear();
        self.inbound.close_all().await;
        self.connections.close_all().await;
    }

    async fn announce(&self) {
        let env = self.registry.announce();
        match wire::encode_envelope(&env) {
            Ok(bytes) => {
                if let Err(e) = self.channel.publish_presence(bytes).await {
                    warn!(error = %e, "presence publish failed");
                }
            }
            Err(e) => warn!(error = %e, "cannot encode presence"),
        }
    }

    fn prune(&mut self) {
        let evicted = self.registry.prune(Instant::now().into_std());
        if evicted.is_empty() {
            return;
        }
        for id in &evicted {
            info!(peer = %id.short(), "peer went silent");
        }
        self.notify_peers();
    }

    fn notify_peers(&self) {
        let _ = self.events.send(NodeEvent::PeersChanged(self.registry.peers()));
    }

    async fn on_rendezvous(&mut self, msg: RendezvousMessage) {
        let Some(inbound) = self.relay.on_envelope(&msg.payload) else {
            return;
        };
        match inbound {
            Inbound::Presence(env) => {
                match self.registry.on_presence(&env, Instant::now().into_std()) {
                    PresenceUpdate::Joined => {
                        info!(peer = %env.sender().short(), "peer joined");
                        self.notify_peers();
                    }
                    PresenceUpdate::Refreshed => self.notify_peers(),
                    PresenceUpdate::Ignored => {}
                }
            }
            Inbound::Signal { from, signal } => self.on_signal(from, signal).await,
        }
    }

    async fn on_signal(&mut self, from: PeerId, signal: Signal) {
        match signal {
            Signal::Offer {
                sdp,
                transfer_type,
                file_info,
            } => {
                debug!(
                    peer = %from.short(),
                    kind = ?transfer_type,
                    file = file_info.as_ref().map(|f| f.name.as_str()),
                    "offer received"
                );
                match self.connections.on_offer(&from, sdp).await {
                    Ok(Some(answer)) => {
                        if let Err(e) = self.relay.send(&from, Signal::Answer { sdp: answer }).await
                        {
                            warn!(peer = %from.short(), error = %e, "cannot send answer");
                            return;
                        }
                        self.connections.answer_sent(&from);
                        if self.connections.reoffer_due(&from) {
                            self.reoffer(&from).await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(peer = %from.short(), error = %e, "cannot answer offer"),
                }
            }
            Signal::Answer { sdp } => {
                if let Err(e) = self.connections.on_answer(&from, sdp).await {
                    warn!(peer = %from.short(), error = %e, "cannot apply answer");
                    self.fail_outbound(&from, None, &format!("negotiation failed: {e}"));
                }
            }
            Signal::Candidate(candidate) => {
                let disposition = self.connections.on_remote_candidate(&from, candidate).await;
                debug!(peer = %from.short(), ?disposition, "remote candidate");
            }
            Signal::TransferComplete { name, channel } => {
                let target = self.outbound.iter().find(|(key, route)| {
                    key.peer == from
                        && match (channel, &name) {
                            (Some(id), _) => key.channel == id,
                            (None, Some(name)) => route.name == *name,
                            (None, None) => route.kind == TransferKind::Text,
                        }
                });
                let routed = target.is_some_and(|(_, route)| {
                    route.events.send(StreamEvent::Completed).is_ok()
                });
                if !routed {
                    debug!(peer = %from.short(), name = ?name, ?channel, "completion for no active transfer");
                }
            }
        }
    }

    async fn on_session_event(&mut self, tagged: TaggedSessionEvent) {
        let TaggedSessionEvent {
            peer,
            session_id,
            event,
        } = tagged;
        let key = |channel| StreamKey {
            peer: peer.clone(),
            session_id,
            channel,
        };
        match event {
            SessionEvent::StateChanged(state) => {
                self.connections.on_session_state(&peer, session_id, state);
                if state == SessionState::Connected
                    && self.connections.is_current(&peer, session_id)
                    && self.connections.reoffer_due(&peer)
                {
                    self.reoffer(&peer).await;
                }
                if state.is_terminal() {
                    let reason = format!("session {state}");
                    self.fail_outbound(&peer, Some(session_id), &reason);
                    self.inbound.on_session_lost(&peer, session_id, &reason).await;
                }
            }
            SessionEvent::LocalCandidate(candidate) => {
                if !self.connections.is_current(&peer, session_id) {
                    debug!(peer = %peer.short(), "candidate of replaced session dropped");
                    return;
                }
                if let Err(e) = self.relay.send(&peer, Signal::Candidate(candidate)).await {
                    warn!(peer = %peer.short(), error = %e, "cannot send candidate");
                }
            }
            SessionEvent::IncomingChannel(channel) => {
                let k = key(channel.id());
                self.inbound.on_incoming_channel(k, channel);
            }
            SessionEvent::ChannelOpen(id) => self.route(&key(id), StreamEvent::Open),
            SessionEvent::Message { channel, message } => {
                let k = key(channel);
                if self.outbound.contains_key(&k) {
                    match message {
                        ChannelMessage::Text(text) => match wire::decode_frame(&text) {
                            Ok(frame) => self.route(&k, StreamEvent::Frame(frame)),
                            Err(e) => warn!(peer = %peer.short(), error = %e, "dropping malformed frame"),
                        },
                        ChannelMessage::Binary(bytes) => {
                            debug!(peer = %peer.short(), bytes = bytes.len(), "binary on outbound channel dropped")
                        }
                    }
                } else {
                    self.inbound.on_message(&k, message).await;
                }
            }
            SessionEvent::BufferedAmountLow(id) => self.route(&key(id), StreamEvent::BufferedLow),
            SessionEvent::ChannelClosed(id) => {
                let k = key(id);
                if self.outbound.contains_key(&k) {
                    self.route(&k, StreamEvent::Closed);
                } else {
                    self.inbound.on_channel_closed(&k).await;
                }
            }
        }
    }

    fn route(&self, key: &StreamKey, event: StreamEvent) {
        if let Some(route) = self.outbound.get(key) {
            let _ = route.events.send(event);
        }
    }

    /// Tell the sender worker its stream to `peer` is gone.
    fn fail_outbound(&self, peer: &PeerId, session_id: Option<u64>, reason: &str) {
        for (key, route) in &self.outbound {
            if key.peer == *peer && session_id.map_or(true, |id| id == key.session_id) {
                let _ = route.events.send(StreamEvent::SessionLost(reason.to_string()));
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::OpenStream { request, reply } => {
                let result = self.open_stream(request).await;
                if let Err(Ok(stream)) = reply.send(result) {
                    self.outbound.remove(&stream.key);
                    stream.channel.close().await;
                }
            }
            Command::CloseStream(key) => {
                self.outbound.remove(&key);
                if !self.outbound.keys().any(|k| k.peer == key.peer) {
                    self.connections.withdraw_offer(&key.peer);
                }
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.registry.peers());
            }
            Command::Disconnect { peer, reply } => {
                let session_id = self.connections.get(&peer).map(|c| c.session_id);
                let closed = self.connections.close(&peer).await;
                if let Some(session_id) = session_id {
                    self.fail_outbound(&peer, Some(session_id), "disconnected");
                    self.inbound
                        .on_session_lost(&peer, session_id, "disconnected")
                        .await;
                }
                let _ = reply.send(closed);
            }
            Command::Shutdown(_) => {}
        }
    }

    /// New offer after yielding a collision, so channels created on our
    /// side get opened by the peer's answer.
    async fn reoffer(&mut self, peer: &PeerId) {
        debug!(peer = %peer.short(), "re-offering after collision");
        let result = match self.connections.create_offer(peer).await {
            Ok(sdp) => {
                let signal = Signal::Offer {
                    sdp,
                    transfer_type: None,
                    file_info: None,
                };
                self.relay.send(peer, signal).await.map_err(negotiation)
            }
            Err(e) => Err(negotiation(e)),
        };
        if let Err(e) = result {
            warn!(peer = %peer.short(), error = %e, "cannot re-offer");
            self.fail_outbound(peer, None, &e.to_string());
        }
    }

    /// Obtain a session, create a fresh channel on it and start an
    /// offer/answer round for it.
    async fn open_stream(&mut self, request: OpenRequest) -> Result<OutboundStream, TransferError> {
        let OpenRequest {
            peer,
            name,
            transfer_type,
            file_info,
        } = request;
        let (session, reused) = self
            .connections
            .session_for_send(&peer)
            .map_err(negotiation)?;
        let session_id = self
            .connections
            .get(&peer)
            .map(|c| c.session_id)
            .ok_or_else(|| TransferError::Negotiation("connection vanished".into()))?;
        let channel = session
            .create_channel(CHANNEL_LABEL)
            .await
            .map_err(negotiation)?;
        let key = StreamKey {
            peer: peer.clone(),
            session_id,
            channel: channel.id(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound.insert(
            key.clone(),
            OutboundRoute {
                name,
                kind: transfer_type,
                events: tx,
            },
        );
        info!(peer = %peer.short(), session = session_id, channel = key.channel, reused, "opening stream");

        let offer = match self.connections.create_offer(&peer).await {
            Ok(offer) => offer,
            Err(e) => {
                self.outbound.remove(&key);
                channel.close().await;
                return Err(negotiation(e));
            }
        };
        let signal = Signal::Offer {
            sdp: offer,
            transfer_type: Some(transfer_type),
            file_info,
        };
        if let Err(e) = self.relay.send(&peer, signal).await {
            self.outbound.remove(&key);
            channel.close().await;
            return Err(negotiation(e));
        }
        Ok(OutboundStream {
            key,
            channel,
            events: rx,
        })
    }
}

fn negotiation(e: impl std::fmt::Display) -> TransferError {
    TransferError::Negotiation(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryNetwork, MemoryPersistence};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct Net {
        broker: MemoryBroker,
        network: MemoryNetwork,
    }

    impl Net {
        fn new() -> Self {
            Self {
                broker: MemoryBroker::new(),
                network: MemoryNetwork::new(),
            }
        }
    }

    struct TestNode {
        id: PeerId,
        handle: NodeHandle,
        events: mpsc::UnboundedReceiver<NodeEvent>,
        persistence: Arc<MemoryPersistence>,
    }

    async fn spawn(net: &Net, id: &str, config: NodeConfig) -> TestNode {
        let identity = Identity {
            id: PeerId::new(id),
            display_name: format!("Node {id}"),
        };
        let (pubsub, inbox) = net.broker.client();
        let persistence = Arc::new(MemoryPersistence::new());
        let collaborators = Collaborators {
            pubsub,
            inbox,
            sessions: net.network.factory(&identity.id),
            persistence: persistence.clone(),
        };
        let (handle, events) = Node::start(identity, "room", config, collaborators)
            .await
            .unwrap();
        TestNode {
            id: PeerId::new(id),
            handle,
            events,
            persistence,
        }
    }

    /// Collect events until the transfer `id` finishes.
    async fn until_finished(node: &mut TestNode, id: TransferId) -> (TransferOutcome, Vec<NodeEvent>) {
        let mut seen = Vec::new();
        let outcome = timeout(Duration::from_secs(600), async {
            loop {
                let event = node.events.recv().await.unwrap();
                seen.push(event.clone());
                if let NodeEvent::TransferFinished { id: done, outcome, .. } = event {
                    if done == id {
                        return outcome;
                    }
                }
            }
        })
        .await
        .unwrap();
        (outcome, seen)
    }

    /// Collect events until `count` inbound transfers finished.
    async fn until_received(node: &mut TestNode, count: usize) -> Vec<NodeEvent> {
        let mut seen = Vec::new();
        let mut finished = 0;
        timeout(Duration::from_secs(600), async {
            while finished < count {
                let event = node.events.recv().await.unwrap();
                if let NodeEvent::TransferFinished {
                    direction: Direction::Inbound,
                    ..
                } = event
                {
                    finished += 1;
                }
                seen.push(event);
            }
        })
        .await
        .unwrap();
        seen
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn peers_discover_each_other_and_stay_listed() {
        let net = Net::new();
        let a = spawn(&net, "a", NodeConfig::default()).await;
        let b = spawn(&net, "b", NodeConfig::default()).await;

        sleep(Duration::from_secs(10)).await;
        assert_eq!(a.handle.peers().await.unwrap()[0].id, b.id);
        assert_eq!(b.handle.peers().await.unwrap()[0].id, a.id);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(a.handle.peers().await.unwrap().len(), 1);
        assert_eq!(b.handle.peers().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_pruned() {
        let net = Net::new();
        let a = spawn(&net, "a", NodeConfig::default()).await;
        let b = spawn(&net, "b", NodeConfig::default()).await;
        sleep(Duration::from_secs(6)).await;
        assert_eq!(a.handle.peers().await.unwrap().len(), 1);

        b.handle.shutdown().await.unwrap();
        sleep(Duration::from_secs(3)).await;
        assert_eq!(a.handle.peers().await.unwrap().len(), 1);
        sleep(Duration::from_secs(14)).await;
        assert!(a.handle.peers().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn large_file_reconstructed_byte_for_byte() {
        let net = Net::new();
        let config = NodeConfig {
            chunk_size: 32 * 1024,
            high_water_mark: 1024 * 1024,
            low_water_mark: 256 * 1024,
            ..NodeConfig::default()
        };
        let mut a = spawn(&net, "a", config.clone()).await;
        let mut b = spawn(&net, "b", config).await;
        let data = payload(10 * 1024 * 1024);

        let id = a
            .handle
            .send_bytes(&b.id, "big.bin", "application/octet-stream", data.clone())
            .unwrap();
        let (outcome, sent_events) = until_finished(&mut a, id).await;
        assert_eq!(outcome, TransferOutcome::Delivered { acknowledged: true });
        let mut last = 0;
        for event in &sent_events {
            if let NodeEvent::TransferProgress { current, total, .. } = event {
                assert!(*current >= last);
                assert!(current <= total);
                last = *current;
            }
        }
        assert_eq!(last, data.len() as u64);

        let received = until_received(&mut b, 1).await;
        let mut last = 0;
        for event in &received {
            if let NodeEvent::TransferProgress {
                direction: Direction::Inbound,
                current,
                ..
            } = event
            {
                assert!(*current > last || *current == data.len() as u64);
                last = *current;
            }
        }
        let items = b.persistence.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "big.bin");
        assert_eq!(items[0].bytes.len(), data.len());
        assert!(items[0].bytes == data);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_drain_notification_does_not_stall() {
        let net = Net::new();
        net.network.suppress_buffered_low(true);
        let config = NodeConfig {
            chunk_size: 32 * 1024,
            ..NodeConfig::default()
        };
        let mut a = spawn(&net, "a", config.clone()).await;
        let b = spawn(&net, "b", config).await;
        let data = payload(3 * 1024 * 1024);

        let id = a
            .handle
            .send_bytes(&b.id, "stall.bin", "application/octet-stream", data.clone())
            .unwrap();
        let (outcome, _) = until_finished(&mut a, id).await;
        assert!(outcome.is_success());
        assert_eq!(b.persistence.items()[0].bytes, data);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_items_reuse_one_connection() {
        let net = Net::new();
        let mut a = spawn(&net, "a", NodeConfig::default()).await;
        let mut b = spawn(&net, "b", NodeConfig::default()).await;

        let first = a.handle.send_bytes(&b.id, "1.txt", "text/plain", b"one".to_vec()).unwrap();
        let second = a.handle.send_text(&b.id, "two").unwrap();
        assert!(until_finished(&mut a, first).await.0.is_success());
        assert!(until_finished(&mut a, second).await.0.is_success());

        assert_eq!(net.network.sessions_opened(&a.id), 1);
        assert_eq!(net.network.sessions_opened(&b.id), 1);
        let received = until_received(&mut b, 1).await;
        assert!(received
            .iter()
            .any(|e| matches!(e, NodeEvent::TransferFinished { name, .. } if name == "1.txt")));
        let text = timeout(Duration::from_secs(60), async {
            loop {
                if let Some(NodeEvent::TextReceived { content, peer }) = b.events.recv().await {
                    return (content, peer);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(text, ("two".to_string(), a.id.clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_senders_are_serialized() {
        let net = Net::new();
        let config = NodeConfig {
            chunk_size: 4 * 1024,
            ..NodeConfig::default()
        };
        let mut a = spawn(&net, "a", config.clone()).await;
        let mut b = spawn(&net, "b", config.clone()).await;
        let mut c = spawn(&net, "c", config).await;

        let from_a = a
            .handle
            .send_bytes(&b.id, "from-a", "application/octet-stream", payload(512 * 1024))
            .unwrap();
        let from_c = c
            .handle
            .send_bytes(&b.id, "from-c", "application/octet-stream", payload(256 * 1024))
            .unwrap();

        let events = until_received(&mut b, 2).await;
        // Map inbound ids to their order of start and finish.
        let mut active: Option<TransferId> = None;
        for event in &events {
            match event {
                NodeEvent::TransferStarted {
                    id,
                    direction: Direction::Inbound,
                    ..
                } => {
                    assert!(active.is_none(), "second inbound transfer started before the first finished");
                    active = Some(*id);
                }
                NodeEvent::TransferProgress {
                    id,
                    direction: Direction::Inbound,
                    ..
                } => assert_eq!(active, Some(*id)),
                NodeEvent::TransferFinished {
                    id,
                    direction: Direction::Inbound,
                    ..
                } => {
                    assert_eq!(active, Some(*id));
                    active = None;
                }
                _ => {}
            }
        }
        assert_eq!(b.persistence.items().len(), 2);
        assert!(until_finished(&mut a, from_a).await.0.is_success());
        assert!(until_finished(&mut c, from_c).await.0.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_completion_signal_resolves_unacknowledged() {
        let net = Net::new();
        net.broker
            .set_drop_filter(|m| String::from_utf8_lossy(&m.payload).contains("transfer-complete"));
        let mut a = spawn(&net, "a", NodeConfig::default()).await;
        let b = spawn(&net, "b", NodeConfig::default()).await;

        let id = a
            .handle
            .send_bytes(&b.id, "x.bin", "application/octet-stream", payload(1000))
            .unwrap();
        let (outcome, _) = until_finished(&mut a, id).await;
        assert_eq!(outcome, TransferOutcome::Delivered { acknowledged: false });
        assert_eq!(b.persistence.items().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_completion_does_not_acknowledge_next_item() {
        let net = Net::new();
        let mut a = spawn(&net, "a", NodeConfig::default()).await;
        let mut b = spawn(&net, "b", NodeConfig::default()).await;
        b.persistence.set_delay(Duration::from_secs(15));

        let one = a
            .handle
            .send_bytes(&b.id, "one", "application/octet-stream", b"1".to_vec())
            .unwrap();
        let two = a
            .handle
            .send_bytes(&b.id, "two", "application/octet-stream", b"2".to_vec())
            .unwrap();
        assert_eq!(
            until_finished(&mut a, one).await.0,
            TransferOutcome::Delivered { acknowledged: false }
        );
        // The completion for "one" lands while "two" is waiting for its own.
        assert_eq!(
            until_finished(&mut a, two).await.0,
            TransferOutcome::Delivered { acknowledged: false }
        );
        let names: Vec<String> = b.persistence.items().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["one"]);

        until_received(&mut b, 2).await;
        assert_eq!(b.persistence.items().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_sends_in_both_directions() {
        let net = Net::new();
        let mut a = spawn(&net, "a", NodeConfig::default()).await;
        let mut b = spawn(&net, "b", NodeConfig::default()).await;

        for round in 0..2 {
            let to_b = a.handle.send_text(&b.id, format!("to b {round}")).unwrap();
            let to_a = b.handle.send_text(&a.id, format!("to a {round}")).unwrap();
            assert_eq!(
                until_finished(&mut a, to_b).await.0,
                TransferOutcome::Delivered { acknowledged: true }
            );
            assert_eq!(
                until_finished(&mut b, to_a).await.0,
                TransferOutcome::Delivered { acknowledged: true }
            );
        }
        assert_eq!(net.network.sessions_opened(&a.id), 1);
        assert_eq!(net.network.sessions_opened(&b.id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_answer_fails_after_connect_timeout() {
        let net = Net::new();
        net.broker
            .set_drop_filter(|m| String::from_utf8_lossy(&m.payload).contains(r#""type":"answer""#));
        let mut a = spawn(&net, "a", NodeConfig::default()).await;
        let b = spawn(&net, "b", NodeConfig::default()).await;

        let id = a.handle.send_text(&b.id, "hello").unwrap();
        let (outcome, _) = until_finished(&mut a, id).await;
        assert_eq!(
            outcome,
            TransferOutcome::Failed {
                reason: TransferError::ConnectTimeout.to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn session_failure_fails_transfer_and_next_send_reconnects() {
        let net = Net::new();
        net.network.suppress_buffered_low(true);
        let config = NodeConfig {
            chunk_size: 64 * 1024,
            ..NodeConfig::default()
        };
        let mut a = spawn(&net, "a", config.clone()).await;
        let mut b = spawn(&net, "b", config).await;

        let id = a
            .handle
            .send_bytes(&b.id, "doomed", "application/octet-stream", payload(8 * 1024 * 1024))
            .unwrap();
        timeout(Duration::from_secs(60), async {
            loop {
                if let Some(NodeEvent::TransferProgress { id: p, .. }) = a.events.recv().await {
                    if p == id {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert!(net.network.fail_link(&a.id, &b.id) > 0);
        let (outcome, _) = until_finished(&mut a, id).await;
        assert!(matches!(outcome, TransferOutcome::Failed { .. }));
        let inbound = until_received(&mut b, 1).await;
        assert!(inbound.iter().any(|e| matches!(
            e,
            NodeEvent::TransferFinished { outcome: TransferOutcome::Failed { .. }, .. }
        )));

        net.network.suppress_buffered_low(false);
        let retry = a.handle.send_text(&b.id, "after").unwrap();
        assert!(until_finished(&mut a, retry).await.0.is_success());
        assert_eq!(net.network.sessions_opened(&a.id), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn long_text_travels_as_file_and_batches_are_numbered() {
        let net = Net::new();
        let config = NodeConfig {
            text_inline_limit: 16,
            ..NodeConfig::default()
        };
        let mut a = spawn(&net, "a", config.clone()).await;
        let mut b = spawn(&net, "b", config).await;

        let long = "x".repeat(100);
        let id = a.handle.send_text(&b.id, long.clone()).unwrap();
        assert!(until_finished(&mut a, id).await.0.is_success());
        let stored = b.persistence.items();
        assert_eq!(stored[0].name, "message.txt");
        assert_eq!(stored[0].mime_type, "text/plain");
        assert_eq!(stored[0].bytes, long.into_bytes());

        let dir = std::env::temp_dir().join(format!("localdrop-batch-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let paths = vec![dir.join("one.txt"), dir.join("two.png")];
        tokio::fs::write(&paths[0], b"first").await.unwrap();
        tokio::fs::write(&paths[1], b"second").await.unwrap();
        let ids = a.handle.send_files(&b.id, paths).unwrap();
        assert!(until_finished(&mut a, ids[1]).await.0.is_success());

        let events = until_received(&mut b, 3).await;
        let batches: Vec<(String, Option<u32>, Option<u32>)> = events
            .iter()
            .filter_map(|e| match e {
                NodeEvent::TransferStarted {
                    name,
                    batch_index,
                    batch_total,
                    direction: Direction::Inbound,
                    ..
                } if batch_total.is_some() => Some((name.clone(), *batch_index, *batch_total)),
                _ => None,
            })
            .collect();
        assert_eq!(
            batches,
            vec![
                ("one.txt".to_string(), Some(1), Some(2)),
                ("two.png".to_string(), Some(2), Some(2)),
            ]
        );
        assert_eq!(b.persistence.items()[2].mime_type, "image/png");
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_reported_and_connection_kept() {
        let net = Net::new();
        let mut a = spawn(&net, "a", NodeConfig::default()).await;
        let mut b = spawn(&net, "b", NodeConfig::default()).await;
        b.persistence.set_failing(true);

        let id = a
            .handle
            .send_bytes(&b.id, "f", "application/octet-stream", payload(10))
            .unwrap();
        assert_eq!(
            until_finished(&mut a, id).await.0,
            TransferOutcome::Delivered { acknowledged: true }
        );
        let events = until_received(&mut b, 1).await;
        assert!(events.iter().any(|e| matches!(
            e,
            NodeEvent::TransferFinished { outcome: TransferOutcome::Failed { .. }, .. }
        )));

        b.persistence.set_failing(false);
        let again = a
            .handle
            .send_bytes(&b.id, "g", "application/octet-stream", payload(10))
            .unwrap();
        assert!(until_finished(&mut a, again).await.0.is_success());
        assert_eq!(net.network.sessions_opened(&a.id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_forces_new_session() {
        let net = Net::new();
        let mut a = spawn(&net, "a", NodeConfig::default()).await;
        let b = spawn(&net, "b", NodeConfig::default()).await;

        let id = a.handle.send_text(&b.id, "one").unwrap();
        assert!(until_finished(&mut a, id).await.0.is_success());
        assert!(a.handle.disconnect(&b.id).await.unwrap());
        assert!(!a.handle.disconnect(&b.id).await.unwrap());

        let id = a.handle.send_text(&b.id, "two").unwrap();
        assert!(until_finished(&mut a, id).await.0.is_success());
        assert_eq!(net.network.sessions_opened(&a.id), 2);
    }

    #[tokio::test]
    async fn invalid_config_rejected() {
        let net = Net::new();
        let (pubsub, inbox) = net.broker.client();
        let identity = Identity::with_name("x");
        let config = NodeConfig {
            chunk_size: 0,
            ..NodeConfig::default()
        };
        let result = Node::start(
            identity.clone(),
            "room",
            config,
            Collaborators {
                pubsub,
                inbox,
                sessions: net.network.factory(&identity.id),
                persistence: Arc::new(MemoryPersistence::new()),
            },
        )
        .await;
        assert!(matches!(result, Err(NodeError::Config(ConfigError::ZeroChunkSize))));
    }
}
