//! In-process collaborators: a publish/subscribe hub, loopback sessions and a
//! persistence sink.
//!
//! Loopback sessions are paired through opaque offer/answer tokens that only
//! mean something inside one [`MemoryNetwork`]. Channels created on a session
//! open when the answer of the next offer is applied. Every channel end has a
//! pump task that hands queued messages to the remote end one at a time, so
//! `buffered_amount` grows while a sender outpaces the pump and
//! `BufferedAmountLow` fires when it drains past the threshold.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::identity::PeerId;
use crate::persist::{PersistError, Persistence, SavedFile};
use crate::rendezvous::{PubSub, RendezvousError, RendezvousMessage};
use crate::session::{
    ChannelId, ChannelMessage, DataChannel, IceCandidate, SdpKind, Session, SessionDescription,
    SessionError, SessionEvent, SessionEvents, SessionFactory, SessionState,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

type DropFilter = Arc<dyn Fn(&RendezvousMessage) -> bool + Send + Sync>;

struct Subscriber {
    topics: Arc<Mutex<HashSet<String>>>,
    tx: mpsc::UnboundedSender<RendezvousMessage>,
}

#[derive(Default)]
struct BrokerInner {
    subscribers: Mutex<Vec<Subscriber>>,
    filter: Mutex<Option<DropFilter>>,
}

/// Publish/subscribe hub. Every client subscribed to a topic receives each
/// message published on it, the publisher included.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// New client and the receiver its subscribed messages arrive on.
    pub fn client(&self) -> (Arc<MemoryPubSub>, mpsc::UnboundedReceiver<RendezvousMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let topics = Arc::new(Mutex::new(HashSet::new()));
        lock(&self.inner.subscribers).push(Subscriber {
            topics: topics.clone(),
            tx,
        });
        let client = Arc::new(MemoryPubSub {
            broker: self.clone(),
            topics,
        });
        (client, rx)
    }

    /// Silently drop every message for which `filter` returns true.
    pub fn set_drop_filter(&self, filter: impl Fn(&RendezvousMessage) -> bool + Send + Sync + 'static) {
        *lock(&self.inner.filter) = Some(Arc::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *lock(&self.inner.filter) = None;
    }

    fn deliver(&self, msg: RendezvousMessage) {
        let filter = lock(&self.inner.filter).clone();
        if filter.is_some_and(|f| f(&msg)) {
            debug!(topic = %msg.topic, "message dropped by filter");
            return;
        }
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|s| !s.tx.is_closed());
        for s in subscribers.iter() {
            if lock(&s.topics).contains(&msg.topic) {
                let _ = s.tx.send(msg.clone());
            }
        }
    }
}

pub struct MemoryPubSub {
    broker: MemoryBroker,
    topics: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, topic: &str) -> Result<(), RendezvousError> {
        lock(&self.topics).insert(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), RendezvousError> {
        self.broker.deliver(RendezvousMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

#[derive(Default)]
struct NetworkInner {
    offers: Mutex<HashMap<String, Weak<SessionInner>>>,
    answers: Mutex<HashMap<String, Weak<SessionInner>>>,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
    opened: Mutex<HashMap<PeerId, usize>>,
    next_channel: AtomicU64,
    suppress_low: Arc<AtomicBool>,
}

impl NetworkInner {
    fn take_token(
        map: &Mutex<HashMap<String, Weak<SessionInner>>>,
        token: &str,
    ) -> Result<Arc<SessionInner>, SessionError> {
        lock(map)
            .remove(token)
            .and_then(|w| w.upgrade())
            .ok_or_else(|| SessionError::InvalidDescription(format!("unknown token {token}")))
    }
}

/// Loopback network shared by every node of a test.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session factory for the node identified by `local`.
    pub fn factory(&self, local: &PeerId) -> Arc<dyn SessionFactory> {
        Arc::new(MemorySessionFactory {
            network: self.inner.clone(),
            local: local.clone(),
        })
    }

    /// Stop emitting `BufferedAmountLow`, as if the notification were lost.
    pub fn suppress_buffered_low(&self, suppress: bool) {
        self.inner.suppress_low.store(suppress, Ordering::SeqCst);
    }

    /// Number of sessions `local` has opened so far.
    pub fn sessions_opened(&self, local: &PeerId) -> usize {
        lock(&self.inner.opened).get(local).copied().unwrap_or(0)
    }

    /// Fail every live session between `a` and `b`. Returns how many failed.
    pub fn fail_link(&self, a: &PeerId, b: &PeerId) -> usize {
        let sessions: Vec<Arc<SessionInner>> = lock(&self.inner.sessions)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| (s.local == *a && s.remote == *b) || (s.local == *b && s.remote == *a))
            .collect();
        let mut failed = 0;
        for s in sessions {
            if s.transition(SessionState::Failed) {
                s.close_channels();
                failed += 1;
            }
        }
        failed
    }
}

struct MemorySessionFactory {
    network: Arc<NetworkInner>,
    local: PeerId,
}

impl SessionFactory for MemorySessionFactory {
    fn open_session(
        &self,
        peer: &PeerId,
        events: SessionEvents,
    ) -> Result<Arc<dyn Session>, SessionError> {
        let inner = Arc::new(SessionInner {
            local: self.local.clone(),
            remote: peer.clone(),
            events,
            network: self.network.clone(),
            state: Mutex::new(SessionState::New),
            link: Mutex::new(Weak::new()),
            pending_offerer: Mutex::new(None),
            remote_set: AtomicBool::new(false),
            pending_channels: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            candidates_applied: AtomicUsize::new(0),
        });
        lock(&self.network.sessions).push(Arc::downgrade(&inner));
        *lock(&self.network.opened).entry(self.local.clone()).or_default() += 1;
        Ok(Arc::new(MemorySession(inner)))
    }
}

struct SessionInner {
    local: PeerId,
    remote: PeerId,
    events: SessionEvents,
    network: Arc<NetworkInner>,
    state: Mutex<SessionState>,
    link: Mutex<Weak<SessionInner>>,
    pending_offerer: Mutex<Option<Weak<SessionInner>>>,
    remote_set: AtomicBool,
    pending_channels: Mutex<Vec<Arc<ChannelEnd>>>,
    channels: Mutex<Vec<Arc<ChannelEnd>>>,
    candidates_applied: AtomicUsize,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Move to `next` unless already there or terminal. Emits the change.
    fn transition(&self, next: SessionState) -> bool {
        {
            let mut state = lock(&self.state);
            if *state == next || state.is_terminal() {
                return false;
            }
            *state = next;
        }
        self.events.emit(SessionEvent::StateChanged(next));
        true
    }

    fn close_channels(&self) {
        let mut all: Vec<Arc<ChannelEnd>> = lock(&self.channels).drain(..).collect();
        all.extend(lock(&self.pending_channels).drain(..));
        for ch in all {
            ch.begin_close();
        }
    }

    fn local_candidate(&self) {
        self.events.emit(SessionEvent::LocalCandidate(IceCandidate::new(format!(
            "memory host {}",
            self.local
        ))));
    }
}

fn link(offerer: &Arc<SessionInner>, responder: &Arc<SessionInner>) {
    *lock(&offerer.link) = Arc::downgrade(responder);
    *lock(&responder.link) = Arc::downgrade(offerer);
    offerer.transition(SessionState::Connected);
    responder.transition(SessionState::Connected);
}

fn open_pending(offerer: &Arc<SessionInner>, responder: &Arc<SessionInner>) {
    let pending: Vec<Arc<ChannelEnd>> = lock(&offerer.pending_channels).drain(..).collect();
    for local in pending {
        if local.closing.load(Ordering::SeqCst) {
            continue;
        }
        let remote = ChannelEnd::spawn(
            local.id,
            &local.label,
            responder.events.clone(),
            offerer.network.suppress_low.clone(),
        );
        let _ = local.peer.set(Arc::downgrade(&remote));
        let _ = remote.peer.set(Arc::downgrade(&local));
        remote.open.store(true, Ordering::SeqCst);
        local.open.store(true, Ordering::SeqCst);
        lock(&responder.channels).push(remote.clone());
        lock(&offerer.channels).push(local.clone());
        responder
            .events
            .emit(SessionEvent::IncomingChannel(remote as Arc<dyn DataChannel>));
        offerer.events.emit(SessionEvent::ChannelOpen(local.id));
    }
}

struct MemorySession(Arc<SessionInner>);

impl MemorySession {
    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.0.state().is_terminal() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    fn state(&self) -> SessionState {
        self.0.state()
    }

    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_live()?;
        let token = format!("memory-offer:{}", Uuid::new_v4());
        lock(&self.0.network.offers).insert(token.clone(), Arc::downgrade(&self.0));
        if self.0.state() == SessionState::New {
            self.0.transition(SessionState::Connecting);
        }
        self.0.local_candidate();
        Ok(SessionDescription::offer(token))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_live()?;
        let offerer = lock(&self.0.pending_offerer)
            .take()
            .and_then(|w| w.upgrade())
            .ok_or_else(|| SessionError::InvalidDescription("no remote offer".into()))?;
        *lock(&self.0.link) = Arc::downgrade(&offerer);
        let token = format!("memory-answer:{}", Uuid::new_v4());
        lock(&self.0.network.answers).insert(token.clone(), Arc::downgrade(&self.0));
        if self.0.state() == SessionState::New {
            self.0.transition(SessionState::Connecting);
        }
        self.0.local_candidate();
        Ok(SessionDescription::answer(token))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        self.ensure_live()?;
        match desc.kind {
            SdpKind::Offer => {
                let offerer = NetworkInner::take_token(&self.0.network.offers, &desc.sdp)?;
                *lock(&self.0.pending_offerer) = Some(Arc::downgrade(&offerer));
            }
            SdpKind::Answer => {
                let responder = NetworkInner::take_token(&self.0.network.answers, &desc.sdp)?;
                link(&self.0, &responder);
                open_pending(&self.0, &responder);
            }
        }
        self.0.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        if !self.0.remote_set.load(Ordering::SeqCst) {
            return Err(SessionError::InvalidCandidate(format!(
                "{} before remote description",
                candidate.candidate
            )));
        }
        self.0.candidates_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, SessionError> {
        self.ensure_live()?;
        let id = self.0.network.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        let end = ChannelEnd::spawn(
            id,
            label,
            self.0.events.clone(),
            self.0.network.suppress_low.clone(),
        );
        lock(&self.0.pending_channels).push(end.clone());
        Ok(end)
    }

    async fn close(&self) {
        if !self.0.transition(SessionState::Closed) {
            return;
        }
        self.0.close_channels();
        let remote = lock(&self.0.link).upgrade();
        if let Some(remote) = remote {
            if remote.transition(SessionState::Disconnected) {
                remote.close_channels();
            }
        }
    }
}

enum PumpItem {
    Message(ChannelMessage),
    Close,
}

struct ChannelEnd {
    id: ChannelId,
    label: String,
    events: SessionEvents,
    open: AtomicBool,
    closing: AtomicBool,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    suppress_low: Arc<AtomicBool>,
    peer: OnceLock<Weak<ChannelEnd>>,
    pump: mpsc::UnboundedSender<PumpItem>,
}

impl ChannelEnd {
    fn spawn(
        id: ChannelId,
        label: &str,
        events: SessionEvents,
        suppress_low: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let end = Arc::new(Self {
            id,
            label: label.to_string(),
            events,
            open: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            suppress_low,
            peer: OnceLock::new(),
            pump: tx,
        });
        tokio::spawn(pump(Arc::downgrade(&end), rx));
        end
    }

    fn peer(&self) -> Option<Arc<ChannelEnd>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn begin_close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.pump.send(PumpItem::Close);
    }
}

async fn pump(weak: Weak<ChannelEnd>, mut rx: mpsc::UnboundedReceiver<PumpItem>) {
    while let Some(item) = rx.recv().await {
        tokio::task::yield_now().await;
        let Some(end) = weak.upgrade() else {
            break;
        };
        match item {
            PumpItem::Message(message) => {
                let len = message.len();
                if let Some(peer) = end.peer() {
                    if peer.open.load(Ordering::SeqCst) {
                        peer.events.emit(SessionEvent::Message {
                            channel: peer.id,
                            message,
                        });
                    }
                }
                let before = end.buffered.fetch_sub(len, Ordering::SeqCst);
                let after = before - len;
                let threshold = end.low_threshold.load(Ordering::SeqCst);
                if before > threshold
                    && after <= threshold
                    && !end.suppress_low.load(Ordering::SeqCst)
                {
                    end.events.emit(SessionEvent::BufferedAmountLow(end.id));
                }
            }
            PumpItem::Close => {
                if let Some(peer) = end.peer() {
                    peer.closing.store(true, Ordering::SeqCst);
                    if peer.open.swap(false, Ordering::SeqCst) {
                        peer.events.emit(SessionEvent::ChannelClosed(peer.id));
                    }
                }
                end.events.emit(SessionEvent::ChannelClosed(end.id));
                break;
            }
        }
    }
}

#[async_trait]
impl DataChannel for ChannelEnd {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
    }

    async fn send(&self, message: ChannelMessage) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::ChannelNotOpen);
        }
        self.buffered.fetch_add(message.len(), Ordering::SeqCst);
        self.pump
            .send(PumpItem::Message(message))
            .map_err(|_| SessionError::Closed)
    }

    async fn close(&self) {
        self.begin_close();
    }
}

/// One item handed to [`MemoryPersistence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct MemoryPersistence {
    items: Mutex<Vec<StoredItem>>,
    failing: AtomicBool,
    delay: Mutex<Duration>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<StoredItem> {
        lock(&self.items).clone()
    }

    /// Make every following save fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every following save take `delay` before it lands.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save(&self, bytes: Vec<u8>, name: &str, mime: &str) -> Result<SavedFile, PersistError> {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistError::Rejected {
                name: name.to_string(),
                reason: "storage unavailable".into(),
            });
        }
        let size = bytes.len() as u64;
        lock(&self.items).push(StoredItem {
            name: name.to_string(),
            mime_type: mime.to_string(),
            bytes,
        });
        Ok(SavedFile {
            location: format!("memory:{name}"),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TaggedSessionEvent;

    #[tokio::test]
    async fn broker_routes_by_topic_and_filter() {
        let broker = MemoryBroker::new();
        let (a, mut rx_a) = broker.client();
        let (b, mut rx_b) = broker.client();
        a.subscribe("t/1").await.unwrap();
        b.subscribe("t/2").await.unwrap();

        b.publish("t/1", b"x".to_vec()).await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap().payload, b"x");
        assert!(rx_b.try_recv().is_err());

        broker.set_drop_filter(|m| m.payload == b"drop");
        a.publish("t/2", b"drop".to_vec()).await.unwrap();
        a.publish("t/2", b"keep".to_vec()).await.unwrap();
        assert_eq!(rx_b.recv().await.unwrap().payload, b"keep");
        assert!(rx_b.try_recv().is_err());
    }

    struct Side {
        session: Arc<dyn Session>,
        rx: mpsc::UnboundedReceiver<TaggedSessionEvent>,
    }

    fn side(net: &MemoryNetwork, local: &str, remote: &str) -> Side {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = SessionEvents::new(PeerId::new(remote), 1, tx);
        let session = net
            .factory(&PeerId::new(local))
            .open_session(&PeerId::new(remote), events)
            .unwrap();
        Side { session, rx }
    }

    async fn negotiate(a: &Side, b: &Side) {
        let offer = a.session.create_offer().await.unwrap();
        b.session.set_remote_description(offer).await.unwrap();
        let answer = b.session.create_answer().await.unwrap();
        a.session.set_remote_description(answer).await.unwrap();
    }

    async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<TaggedSessionEvent>, mut f: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        loop {
            let ev = rx.recv().await.unwrap().event;
            if f(&ev) {
                return ev;
            }
        }
    }

    #[tokio::test]
    async fn channel_opens_after_answer_and_carries_messages() {
        let net = MemoryNetwork::new();
        let a = side(&net, "a", "b");
        let mut b = side(&net, "b", "a");
        let ch = a.session.create_channel("data").await.unwrap();
        assert!(!ch.is_open());
        negotiate(&a, &b).await;
        assert!(ch.is_open());
        assert_eq!(a.session.state(), SessionState::Connected);

        let remote = match next_matching(&mut b.rx, |e| matches!(e, SessionEvent::IncomingChannel(_))).await {
            SessionEvent::IncomingChannel(c) => c,
            _ => unreachable!(),
        };
        assert_eq!(remote.id(), ch.id());
        ch.send(ChannelMessage::Text("hi".into())).await.unwrap();
        match next_matching(&mut b.rx, |e| matches!(e, SessionEvent::Message { .. })).await {
            SessionEvent::Message { message, .. } => assert_eq!(message, ChannelMessage::Text("hi".into())),
            _ => unreachable!(),
        }

        remote.close().await;
        next_matching(&mut b.rx, |e| matches!(e, SessionEvent::ChannelClosed(_))).await;
        assert!(!ch.is_open());
    }

    #[tokio::test]
    async fn buffered_low_fires_after_drain() {
        let net = MemoryNetwork::new();
        let mut a = side(&net, "a", "b");
        let b = side(&net, "b", "a");
        let ch = a.session.create_channel("data").await.unwrap();
        negotiate(&a, &b).await;
        ch.set_buffered_amount_low_threshold(10);
        for _ in 0..4 {
            ch.send(ChannelMessage::Binary(vec![0; 8])).await.unwrap();
        }
        assert_eq!(ch.buffered_amount(), 32);
        next_matching(&mut a.rx, |e| matches!(e, SessionEvent::BufferedAmountLow(_))).await;
        assert!(ch.buffered_amount() <= 10);
    }

    #[tokio::test]
    async fn candidate_before_remote_description_rejected() {
        let net = MemoryNetwork::new();
        let a = side(&net, "a", "b");
        assert!(matches!(
            a.session.add_ice_candidate(IceCandidate::new("c")).await,
            Err(SessionError::InvalidCandidate(_))
        ));
    }

    #[tokio::test]
    async fn close_disconnects_remote() {
        let net = MemoryNetwork::new();
        let a = side(&net, "a", "b");
        let mut b = side(&net, "b", "a");
        negotiate(&a, &b).await;
        a.session.close().await;
        assert_eq!(a.session.state(), SessionState::Closed);
        next_matching(&mut b.rx, |e| {
            matches!(e, SessionEvent::StateChanged(SessionState::Disconnected))
        })
        .await;
        assert!(a.session.create_channel("x").await.is_err());
    }

    #[tokio::test]
    async fn fail_link_fails_both_sides() {
        let net = MemoryNetwork::new();
        let a = side(&net, "a", "b");
        let b = side(&net, "b", "a");
        negotiate(&a, &b).await;
        assert_eq!(net.fail_link(&PeerId::new("a"), &PeerId::new("b")), 2);
        assert_eq!(b.session.state(), SessionState::Failed);
        assert_eq!(net.sessions_opened(&PeerId::new("a")), 1);
    }

    #[tokio::test]
    async fn persistence_records_and_fails() {
        let p = MemoryPersistence::new();
        let saved = p.save(b"abc".to_vec(), "a.txt", "text/plain").await.unwrap();
        assert_eq!(saved.size, 3);
        p.set_failing(true);
        assert!(p.save(Vec::new(), "b", "x").await.is_err());
        assert_eq!(p.items().len(), 1);
    }
}
