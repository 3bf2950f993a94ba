//! Connection manager: one negotiation state machine per remote peer.
//!
//! The peer-id keyed map is the only record of which session belongs to which
//! peer. Candidates that arrive before a connection (or its remote
//! description) exists are parked per peer and applied in arrival order as
//! soon as the remote description is installed.
//!
//! When both ends offer at once, the peer with the lower id keeps its offer.
//! The other end drops its own, answers, and re-offers once the session is
//! connected so its pending channels still open.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::identity::PeerId;
use crate::session::{
    IceCandidate, Session, SessionDescription, SessionError, SessionEvents, SessionFactory,
    SessionState, TaggedSessionEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Negotiating,
    Established,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Negotiating => write!(f, "negotiating"),
            ConnectionState::Established => write!(f, "established"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

pub struct Connection {
    pub peer_id: PeerId,
    /// Generation of the session; events from older sessions are ignored.
    pub session_id: u64,
    pub role: Role,
    pub state: ConnectionState,
    session: Arc<dyn Session>,
    remote_description_set: bool,
    /// Our offer is out and its answer has not been applied yet.
    offer_pending: bool,
    /// We yielded an offer collision and owe the peer a new offer.
    reoffer: bool,
}

impl Connection {
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    fn is_live(&self) -> bool {
        self.state != ConnectionState::Closed && !self.session.state().is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no connection to peer {0}")]
    NoConnection(PeerId),
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct ConnectionManager {
    self_id: PeerId,
    factory: Arc<dyn SessionFactory>,
    events_tx: mpsc::UnboundedSender<TaggedSessionEvent>,
    next_session_id: u64,
    connections: HashMap<PeerId, Connection>,
    pending: HashMap<PeerId, VecDeque<IceCandidate>>,
}

impl ConnectionManager {
    pub fn new(
        self_id: PeerId,
        factory: Arc<dyn SessionFactory>,
        events_tx: mpsc::UnboundedSender<TaggedSessionEvent>,
    ) -> Self {
        Self {
            self_id,
            factory,
            events_tx,
            next_session_id: 1,
            connections: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Live connection for `peer`, or a freshly opened session. Returns the
    /// session and whether it was reused.
    pub fn session_for_send(
        &mut self,
        peer: &PeerId,
    ) -> Result<(Arc<dyn Session>, bool), ConnectionError> {
        let (conn, reused) = self.obtain(peer, Role::Initiator)?;
        Ok((conn.session.clone(), reused))
    }

    /// Start a new offer/answer round as initiator on the peer's session.
    pub async fn create_offer(
        &mut self,
        peer: &PeerId,
    ) -> Result<SessionDescription, ConnectionError> {
        let conn = self
            .connections
            .get_mut(peer)
            .ok_or_else(|| ConnectionError::NoConnection(peer.clone()))?;
        conn.role = Role::Initiator;
        conn.state = ConnectionState::Negotiating;
        conn.offer_pending = true;
        conn.reoffer = false;
        let offer = conn.session.create_offer().await?;
        debug!(peer = %peer.short(), session = conn.session_id, "offer created");
        Ok(offer)
    }

    /// Handle a remote offer: create or reuse the session, install the offer,
    /// drain parked candidates and produce the answer. `None` when the offer
    /// collided with ours and ours wins.
    pub async fn on_offer(
        &mut self,
        peer: &PeerId,
        offer: SessionDescription,
    ) -> Result<Option<SessionDescription>, ConnectionError> {
        let keep_ours = self.self_id < *peer;
        if let Some(conn) = self.connections.get_mut(peer).filter(|c| c.offer_pending) {
            if keep_ours {
                debug!(peer = %peer.short(), "offer collision, keeping ours");
                return Ok(None);
            }
            debug!(peer = %peer.short(), "offer collision, yielding");
            conn.offer_pending = false;
            conn.reoffer = true;
        }
        let queued = self.pending.remove(peer).unwrap_or_default();
        let (conn, reused) = self.obtain(peer, Role::Responder)?;
        conn.role = Role::Responder;
        conn.state = ConnectionState::Negotiating;
        let session = conn.session.clone();
        let session_id = conn.session_id;
        debug!(peer = %peer.short(), session = session_id, reused, "offer received");

        let result = async {
            session.set_remote_description(offer).await?;
            Ok::<_, SessionError>(())
        }
        .await;
        if let Err(e) = result {
            self.evict(peer).await;
            return Err(e.into());
        }
        if let Some(conn) = self.connections.get_mut(peer) {
            conn.remote_description_set = true;
        }
        apply_in_order(peer, &session, queued).await;

        match session.create_answer().await {
            Ok(answer) => Ok(Some(answer)),
            Err(e) => {
                self.evict(peer).await;
                Err(e.into())
            }
        }
    }

    /// Our answer went out; payload may flow.
    pub fn answer_sent(&mut self, peer: &PeerId) {
        if let Some(conn) = self.connections.get_mut(peer) {
            if conn.role == Role::Responder && conn.state == ConnectionState::Negotiating {
                conn.state = ConnectionState::Established;
                info!(peer = %peer.short(), "connection established (responder)");
            }
        }
    }

    /// True once after a yielded collision when the session is connected and
    /// the new offer can go out.
    pub fn reoffer_due(&mut self, peer: &PeerId) -> bool {
        match self.connections.get_mut(peer) {
            Some(c) if c.reoffer && c.session.state() == SessionState::Connected => {
                c.reoffer = false;
                true
            }
            _ => false,
        }
    }

    /// The stream our offer was for is gone; stop waiting for its answer.
    pub fn withdraw_offer(&mut self, peer: &PeerId) {
        if let Some(conn) = self.connections.get_mut(peer) {
            conn.offer_pending = false;
            conn.reoffer = false;
        }
    }

    /// Handle a remote answer. Returns false for stale answers that match no
    /// outstanding offer.
    pub async fn on_answer(
        &mut self,
        peer: &PeerId,
        answer: SessionDescription,
    ) -> Result<bool, ConnectionError> {
        let session = match self.connections.get(peer) {
            Some(c) if c.offer_pending => c.session.clone(),
            _ => {
                debug!(peer = %peer.short(), "stale answer dropped");
                return Ok(false);
            }
        };
        if let Err(e) = session.set_remote_description(answer).await {
            self.evict(peer).await;
            return Err(e.into());
        }
        let queued = self.pending.remove(peer).unwrap_or_default();
        if let Some(conn) = self.connections.get_mut(peer) {
            conn.remote_description_set = true;
            conn.offer_pending = false;
            conn.state = ConnectionState::Established;
        }
        apply_in_order(peer, &session, queued).await;
        info!(peer = %peer.short(), "connection established (initiator)");
        Ok(true)
    }

    /// Apply a remote candidate now if possible, otherwise park it.
    pub async fn on_remote_candidate(
        &mut self,
        peer: &PeerId,
        candidate: IceCandidate,
    ) -> CandidateDisposition {
        let ready = self
            .connections
            .get(peer)
            .filter(|c| c.remote_description_set && c.is_live())
            .map(|c| c.session.clone());
        // Anything still parked must go first to keep arrival order.
        let has_backlog = self.pending.get(peer).is_some_and(|q| !q.is_empty());
        match ready {
            Some(session) if !has_backlog => {
                if let Err(e) = session.add_ice_candidate(candidate).await {
                    warn!(peer = %peer.short(), error = %e, "failed to apply candidate");
                }
                CandidateDisposition::Applied
            }
            _ => {
                self.pending
                    .entry(peer.clone())
                    .or_default()
                    .push_back(candidate);
                CandidateDisposition::Queued
            }
        }
    }

    /// Session state report. A terminal state evicts the connection and
    /// returns it (marked closed) so the caller can fail whatever ran on it.
    pub fn on_session_state(
        &mut self,
        peer: &PeerId,
        session_id: u64,
        state: SessionState,
    ) -> Option<Connection> {
        if !self.is_current(peer, session_id) {
            debug!(peer = %peer.short(), session = session_id, %state, "state of replaced session ignored");
            return None;
        }
        if !state.is_terminal() {
            debug!(peer = %peer.short(), %state, "session state");
            return None;
        }
        let mut conn = self.connections.remove(peer)?;
        self.pending.remove(peer);
        conn.state = ConnectionState::Closed;
        warn!(peer = %peer.short(), %state, role = ?conn.role, "connection closed by transport");
        Some(conn)
    }

    pub fn is_current(&self, peer: &PeerId, session_id: u64) -> bool {
        self.connections
            .get(peer)
            .is_some_and(|c| c.session_id == session_id)
    }

    pub fn state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.connections.get(peer).map(|c| c.state)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&Connection> {
        self.connections.get(peer)
    }

    pub fn pending_candidates(&self, peer: &PeerId) -> usize {
        self.pending.get(peer).map_or(0, |q| q.len())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close and forget the connection to `peer`.
    pub async fn close(&mut self, peer: &PeerId) -> bool {
        self.pending.remove(peer);
        match self.connections.remove(peer) {
            Some(conn) => {
                conn.session.close().await;
                info!(peer = %peer.short(), "connection closed");
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&mut self) {
        let peers: Vec<PeerId> = self.connections.keys().cloned().collect();
        for peer in peers {
            self.close(&peer).await;
        }
        self.pending.clear();
    }

    fn obtain(
        &mut self,
        peer: &PeerId,
        role: Role,
    ) -> Result<(&mut Connection, bool), ConnectionError> {
        let reusable = self.connections.get(peer).is_some_and(|c| c.is_live());
        if reusable {
            let conn = self
                .connections
                .get_mut(peer)
                .ok_or_else(|| ConnectionError::NoConnection(peer.clone()))?;
            return Ok((conn, true));
        }
        if let Some(stale) = self.connections.remove(peer) {
            debug!(peer = %peer.short(), session = stale.session_id, "replacing dead session");
        }
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        let events = SessionEvents::new(peer.clone(), session_id, self.events_tx.clone());
        let session = self.factory.open_session(peer, events)?;
        info!(peer = %peer.short(), session = session_id, ?role, "session opened");
        let conn = self.connections.entry(peer.clone()).or_insert(Connection {
            peer_id: peer.clone(),
            session_id,
            role,
            state: ConnectionState::Negotiating,
            session,
            remote_description_set: false,
            offer_pending: false,
            reoffer: false,
        });
        Ok((conn, false))
    }

    async fn evict(&mut self, peer: &PeerId) {
        if let Some(conn) = self.connections.remove(peer) {
            conn.session.close().await;
        }
        self.pending.remove(peer);
    }
}

async fn apply_in_order(peer: &PeerId, session: &Arc<dyn Session>, queued: VecDeque<IceCandidate>) {
    if queued.is_empty() {
        return;
    }
    debug!(peer = %peer.short(), count = queued.len(), "draining parked candidates");
    for candidate in queued {
        if let Err(e) = session.add_ice_candidate(candidate).await {
            warn!(peer = %peer.short(), error = %e, "failed to apply parked candidate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DataChannel;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call in order.
    struct FakeSession {
        log: Arc<Mutex<Vec<String>>>,
        state: Mutex<SessionState>,
    }

    #[async_trait]
    impl Session for FakeSession {
        fn state(&self) -> SessionState {
            *self.state.lock().unwrap()
        }

        async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
            self.log.lock().unwrap().push("create_offer".into());
            Ok(SessionDescription::offer("o"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
            self.log.lock().unwrap().push("create_answer".into());
            Ok(SessionDescription::answer("a"))
        }

        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), SessionError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("remote:{}", desc.sdp));
            if desc.sdp == "bad" {
                return Err(SessionError::InvalidDescription("bad".into()));
            }
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn create_channel(
            &self,
            _label: &str,
        ) -> Result<Arc<dyn DataChannel>, SessionError> {
            Err(SessionError::Closed)
        }

        async fn close(&self) {
            self.log.lock().unwrap().push("close".into());
            *self.state.lock().unwrap() = SessionState::Closed;
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        log: Arc<Mutex<Vec<String>>>,
        opened: Mutex<Vec<Arc<FakeSession>>>,
    }

    impl SessionFactory for FakeFactory {
        fn open_session(
            &self,
            _peer: &PeerId,
            _events: SessionEvents,
        ) -> Result<Arc<dyn Session>, SessionError> {
            let s = Arc::new(FakeSession {
                log: self.log.clone(),
                state: Mutex::new(SessionState::New),
            });
            self.opened.lock().unwrap().push(s.clone());
            Ok(s)
        }
    }

    fn manager() -> (ConnectionManager, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        (ConnectionManager::new(PeerId::new("m"), factory.clone(), tx), factory)
    }

    fn log(f: &FakeFactory) -> Vec<String> {
        f.log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn early_candidates_applied_after_remote_description() {
        let (mut mgr, factory) = manager();
        let peer = PeerId::new("a");
        for c in ["c1", "c2", "c3"] {
            assert_eq!(
                mgr.on_remote_candidate(&peer, IceCandidate::new(c)).await,
                CandidateDisposition::Queued
            );
        }
        assert_eq!(mgr.pending_candidates(&peer), 3);
        assert!(log(&factory).is_empty());

        mgr.on_offer(&peer, SessionDescription::offer("o1")).await.unwrap();
        assert_eq!(
            log(&factory),
            vec!["remote:o1", "candidate:c1", "candidate:c2", "candidate:c3", "create_answer"]
        );
        assert_eq!(mgr.pending_candidates(&peer), 0);
        assert_eq!(mgr.state(&peer), Some(ConnectionState::Negotiating));
        mgr.answer_sent(&peer);
        assert_eq!(mgr.state(&peer), Some(ConnectionState::Established));

        assert_eq!(
            mgr.on_remote_candidate(&peer, IceCandidate::new("c4")).await,
            CandidateDisposition::Applied
        );
        assert_eq!(log(&factory).last().unwrap(), "candidate:c4");
    }

    #[tokio::test]
    async fn initiator_parks_candidates_until_answer() {
        let (mut mgr, factory) = manager();
        let peer = PeerId::new("b");
        let (_session, reused) = mgr.session_for_send(&peer).unwrap();
        assert!(!reused);
        mgr.create_offer(&peer).await.unwrap();
        assert_eq!(
            mgr.on_remote_candidate(&peer, IceCandidate::new("early")).await,
            CandidateDisposition::Queued
        );
        assert!(mgr.on_answer(&peer, SessionDescription::answer("ans")).await.unwrap());
        assert_eq!(
            log(&factory),
            vec!["create_offer", "remote:ans", "candidate:early"]
        );
        assert_eq!(mgr.state(&peer), Some(ConnectionState::Established));
    }

    #[tokio::test]
    async fn stale_answer_ignored() {
        let (mut mgr, _factory) = manager();
        let peer = PeerId::new("c");
        assert!(!mgr.on_answer(&peer, SessionDescription::answer("x")).await.unwrap());
        assert!(mgr.get(&peer).is_none());
    }

    #[tokio::test]
    async fn live_session_is_reused() {
        let (mut mgr, factory) = manager();
        let peer = PeerId::new("d");
        mgr.session_for_send(&peer).unwrap();
        mgr.create_offer(&peer).await.unwrap();
        mgr.on_answer(&peer, SessionDescription::answer("a1")).await.unwrap();

        let (_s, reused) = mgr.session_for_send(&peer).unwrap();
        assert!(reused);
        mgr.on_offer(&peer, SessionDescription::offer("o2")).await.unwrap();
        assert_eq!(factory.opened.lock().unwrap().len(), 1);
        assert_eq!(mgr.get(&peer).unwrap().role, Role::Responder);
    }

    #[tokio::test]
    async fn terminal_state_evicts_and_next_send_recreates() {
        let (mut mgr, factory) = manager();
        let peer = PeerId::new("e");
        mgr.session_for_send(&peer).unwrap();
        let sid = mgr.get(&peer).unwrap().session_id;

        assert!(mgr
            .on_session_state(&peer, sid, SessionState::Connected)
            .is_none());
        let closed = mgr
            .on_session_state(&peer, sid, SessionState::Failed)
            .unwrap();
        assert_eq!(closed.state, ConnectionState::Closed);
        assert!(mgr.get(&peer).is_none());

        let (_s, reused) = mgr.session_for_send(&peer).unwrap();
        assert!(!reused);
        assert_eq!(factory.opened.lock().unwrap().len(), 2);
        // A late failure report from the first session must not evict the new one.
        assert!(mgr.on_session_state(&peer, sid, SessionState::Failed).is_none());
        assert!(mgr.get(&peer).is_some());
    }

    #[tokio::test]
    async fn dead_session_not_reused() {
        let (mut mgr, factory) = manager();
        let peer = PeerId::new("f");
        mgr.session_for_send(&peer).unwrap();
        *factory.opened.lock().unwrap()[0].state.lock().unwrap() = SessionState::Disconnected;
        let (_s, reused) = mgr.session_for_send(&peer).unwrap();
        assert!(!reused);
    }

    #[tokio::test]
    async fn bad_offer_evicts() {
        let (mut mgr, _factory) = manager();
        let peer = PeerId::new("g");
        assert!(mgr
            .on_offer(&peer, SessionDescription::offer("bad"))
            .await
            .is_err());
        assert!(mgr.get(&peer).is_none());
    }

    #[tokio::test]
    async fn explicit_close() {
        let (mut mgr, factory) = manager();
        let peer = PeerId::new("h");
        mgr.session_for_send(&peer).unwrap();
        assert!(mgr.close(&peer).await);
        assert!(!mgr.close(&peer).await);
        assert_eq!(log(&factory), vec!["close"]);
        assert!(mgr.is_empty());
    }

    fn manager_as(id: &str) -> (ConnectionManager, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        (ConnectionManager::new(PeerId::new(id), factory.clone(), tx), factory)
    }

    #[tokio::test]
    async fn offer_collision_lower_id_keeps_its_offer() {
        let (mut mgr, factory) = manager_as("a");
        let peer = PeerId::new("z");
        mgr.session_for_send(&peer).unwrap();
        mgr.create_offer(&peer).await.unwrap();

        let answer = mgr.on_offer(&peer, SessionDescription::offer("theirs")).await.unwrap();
        assert!(answer.is_none());
        assert_eq!(mgr.get(&peer).unwrap().role, Role::Initiator);
        assert!(!mgr.reoffer_due(&peer));

        assert!(mgr.on_answer(&peer, SessionDescription::answer("ans")).await.unwrap());
        assert_eq!(log(&factory), vec!["create_offer", "remote:ans"]);
        assert_eq!(mgr.state(&peer), Some(ConnectionState::Established));
    }

    #[tokio::test]
    async fn offer_collision_higher_id_yields_and_reoffers() {
        let (mut mgr, factory) = manager_as("z");
        let peer = PeerId::new("a");
        mgr.session_for_send(&peer).unwrap();
        mgr.create_offer(&peer).await.unwrap();

        let answer = mgr.on_offer(&peer, SessionDescription::offer("theirs")).await.unwrap();
        assert!(answer.is_some());
        mgr.answer_sent(&peer);
        assert_eq!(mgr.get(&peer).unwrap().role, Role::Responder);
        // An answer to the dropped offer can no longer be applied.
        assert!(!mgr.on_answer(&peer, SessionDescription::answer("late")).await.unwrap());

        assert!(!mgr.reoffer_due(&peer));
        *factory.opened.lock().unwrap()[0].state.lock().unwrap() = SessionState::Connected;
        assert!(mgr.reoffer_due(&peer));
        assert!(!mgr.reoffer_due(&peer));

        mgr.create_offer(&peer).await.unwrap();
        assert!(mgr.on_answer(&peer, SessionDescription::answer("ans")).await.unwrap());
        assert_eq!(
            log(&factory),
            vec!["create_offer", "remote:theirs", "create_answer", "create_offer", "remote:ans"]
        );
        assert_eq!(factory.opened.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn withdrawn_offer_no_longer_blocks_offers() {
        let (mut mgr, _factory) = manager_as("a");
        let peer = PeerId::new("z");
        mgr.session_for_send(&peer).unwrap();
        mgr.create_offer(&peer).await.unwrap();
        mgr.withdraw_offer(&peer);
        let answer = mgr.on_offer(&peer, SessionDescription::offer("theirs")).await.unwrap();
        assert!(answer.is_some());
    }
}
