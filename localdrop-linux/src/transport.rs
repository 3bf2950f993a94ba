//! TCP sessions.
//!
//! The offerer listens on an ephemeral port and announces one `tcp <ip>
//! <port>` candidate per local address. The answerer dials candidates as they
//! arrive and proves itself with the offer token. One TCP link carries every
//! channel of the session as length-prefixed frames, and later offers on the
//! same session reuse the link.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use localdrop_core::{
    ChannelId, ChannelMessage, DataChannel, IceCandidate, PeerId, SdpKind, Session,
    SessionDescription, SessionError, SessionEvent, SessionEvents, SessionFactory, SessionState,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SDP_PREFIX: &str = "localdrop-tcp";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FRAME: usize = 16 * 1024 * 1024;
/// kind (1) + channel id (8)
const FRAME_HEADER: usize = 9;

const KIND_HELLO: u8 = 0;
const KIND_OPEN: u8 = 1;
const KIND_TEXT: u8 = 2;
const KIND_BINARY: u8 = 3;
const KIND_CLOSE: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    kind: u8,
    channel: ChannelId,
    payload: Vec<u8>,
}

impl Frame {
    fn new(kind: u8, channel: ChannelId, payload: Vec<u8>) -> Self {
        Self {
            kind,
            channel,
            payload,
        }
    }

    /// Length (u32 BE) of what follows, kind, channel id (u64 BE), payload.
    fn encode(&self) -> Vec<u8> {
        let len = FRAME_HEADER + self.payload.len();
        let mut out = Vec::with_capacity(4 + len);
        out.extend_from_slice(&(len as u32).to_be_bytes());
        out.push(self.kind);
        out.extend_from_slice(&self.channel.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Next frame, `None` on clean EOF.
async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Option<Frame>> {
    let mut len = [0u8; 4];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len) as usize;
    if !(FRAME_HEADER..=MAX_FRAME + FRAME_HEADER).contains(&len) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad frame length {len}"),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    let mut channel = [0u8; 8];
    channel.copy_from_slice(&buf[1..FRAME_HEADER]);
    Ok(Some(Frame {
        kind: buf[0],
        channel: u64::from_be_bytes(channel),
        payload: buf.split_off(FRAME_HEADER),
    }))
}

#[derive(Debug, PartialEq, Eq)]
struct Described {
    token: String,
    port: Option<u16>,
    reuse: bool,
}

fn describe(token: &str, port: Option<u16>, reuse: bool) -> String {
    let mut sdp = format!("{SDP_PREFIX} token={token}");
    if let Some(port) = port {
        sdp.push_str(&format!(" port={port}"));
    }
    if reuse {
        sdp.push_str(" reuse");
    }
    sdp
}

fn parse_description(sdp: &str) -> Result<Described, SessionError> {
    let invalid = |what: String| SessionError::InvalidDescription(what);
    let mut parts = sdp.split_whitespace();
    if parts.next() != Some(SDP_PREFIX) {
        return Err(invalid(format!("not a {SDP_PREFIX} description")));
    }
    let mut d = Described {
        token: String::new(),
        port: None,
        reuse: false,
    };
    for part in parts {
        match part.split_once('=') {
            Some(("token", t)) => d.token = t.to_string(),
            Some(("port", p)) => {
                d.port = Some(p.parse().map_err(|_| invalid(format!("bad port {p:?}")))?)
            }
            None if part == "reuse" => d.reuse = true,
            _ => return Err(invalid(format!("unexpected {part:?}"))),
        }
    }
    if d.token.is_empty() {
        return Err(invalid("missing token".into()));
    }
    Ok(d)
}

fn parse_candidate(candidate: &str) -> Result<SocketAddr, SessionError> {
    let bad = || SessionError::InvalidCandidate(candidate.to_string());
    let mut parts = candidate.split_whitespace();
    if parts.next() != Some("tcp") {
        return Err(bad());
    }
    let ip: IpAddr = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let port: u16 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    Ok(SocketAddr::new(ip, port))
}

/// Primary outbound address (if any) plus loopback.
fn local_addresses() -> Vec<IpAddr> {
    let mut out = Vec::new();
    // Connecting a UDP socket sends nothing; it only picks the route.
    if let Ok(sock) = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
        if sock.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).is_ok() {
            if let Ok(addr) = sock.local_addr() {
                let ip = addr.ip();
                if !ip.is_unspecified() && !ip.is_loopback() {
                    out.push(ip);
                }
            }
        }
    }
    out.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    out
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Outgoing {
    Frame {
        bytes: Vec<u8>,
        /// Channel whose buffered amount this frame counts towards.
        accounted: Option<(ChannelId, usize)>,
    },
    Shutdown,
}

#[derive(Clone)]
struct Link {
    generation: u64,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Link {
    fn send(&self, frame: &Frame, accounted: Option<(ChannelId, usize)>) -> bool {
        self.tx
            .send(Outgoing::Frame {
                bytes: frame.encode(),
                accounted,
            })
            .is_ok()
    }
}

pub struct TcpSessionFactory {
    connect_timeout: Duration,
}

impl TcpSessionFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl SessionFactory for TcpSessionFactory {
    fn open_session(
        &self,
        peer: &PeerId,
        events: SessionEvents,
    ) -> Result<Arc<dyn Session>, SessionError> {
        Ok(Arc::new(TcpSession(Arc::new(Inner {
            peer: peer.clone(),
            events,
            connect_timeout: self.connect_timeout,
            state: Mutex::new(SessionState::New),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            offer_token: Mutex::new(None),
            remote_token: Mutex::new(None),
            dial_token: Mutex::new(None),
            answered: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
        }))))
    }
}

struct Inner {
    peer: PeerId,
    events: SessionEvents,
    connect_timeout: Duration,
    state: Mutex<SessionState>,
    link: Mutex<Option<Link>>,
    /// Bumped for every installed link.
    generation: AtomicU64,
    /// Token of our latest offer.
    offer_token: Mutex<Option<String>>,
    /// Token of the latest remote offer, consumed by the answer.
    remote_token: Mutex<Option<String>>,
    /// Token to present while dialing candidates.
    dial_token: Mutex<Option<String>>,
    answered: AtomicBool,
    remote_set: AtomicBool,
    /// Created locally, opened once the answer is in and the link is up.
    pending: Mutex<Vec<Arc<TcpChannel>>>,
    channels: Mutex<HashMap<ChannelId, Arc<TcpChannel>>>,
}

impl Inner {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

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

    fn current_link(&self) -> Option<Link> {
        lock(&self.link).clone()
    }

    fn install_link(self: &Arc<Self>, stream: TcpStream) -> bool {
        let generation;
        {
            let mut link = lock(&self.link);
            if link.is_some() || self.state().is_terminal() {
                return false;
            }
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let (r, w) = stream.into_split();
            let (tx, rx) = mpsc::unbounded_channel();
            *link = Some(Link { generation, tx });
            tokio::spawn(write_loop(w, rx, Arc::downgrade(self)));
            tokio::spawn(read_loop(r, self.clone(), generation));
        }
        info!(peer = %self.peer.short(), generation, "tcp link up");
        *lock(&self.dial_token) = None;
        self.transition(SessionState::Connected);
        self.open_pending();
        true
    }

    /// Drop the current link without changing the session state.
    fn detach_link(&self) {
        let link = lock(&self.link).take();
        if let Some(link) = link {
            let _ = link.tx.send(Outgoing::Shutdown);
            self.close_channels();
        }
    }

    fn link_lost(&self, generation: u64) {
        let lost = {
            let mut link = lock(&self.link);
            if link.as_ref().is_some_and(|l| l.generation == generation) {
                link.take()
            } else {
                None
            }
        };
        if lost.is_some() {
            warn!(peer = %self.peer.short(), generation, "tcp link lost");
            self.transition(SessionState::Disconnected);
            self.close_channels();
        }
    }

    fn close_channels(&self) {
        let mut all: Vec<Arc<TcpChannel>> =
            lock(&self.channels).drain().map(|(_, c)| c).collect();
        all.extend(lock(&self.pending).drain(..));
        for ch in all {
            ch.shut();
        }
    }

    fn open_pending(&self) {
        if !self.answered.load(Ordering::SeqCst) {
            return;
        }
        let Some(link) = self.current_link() else {
            return;
        };
        let pending: Vec<Arc<TcpChannel>> = lock(&self.pending).drain(..).collect();
        for ch in pending {
            if ch.closed.load(Ordering::SeqCst) {
                continue;
            }
            *lock(&ch.link) = Some(link.clone());
            lock(&self.channels).insert(ch.id, ch.clone());
            link.send(
                &Frame::new(KIND_OPEN, ch.id, ch.label.clone().into_bytes()),
                None,
            );
            ch.open.store(true, Ordering::SeqCst);
            self.events.emit(SessionEvent::ChannelOpen(ch.id));
        }
    }

    fn drained(&self, id: ChannelId, len: usize) {
        let ch = lock(&self.channels).get(&id).cloned();
        if let Some(ch) = ch {
            ch.drained(len);
        }
    }

    fn on_frame(self: &Arc<Self>, frame: Frame) {
        let Frame {
            kind,
            channel,
            payload,
        } = frame;
        match kind {
            KIND_OPEN => {
                let Some(link) = self.current_link() else {
                    return;
                };
                let label = String::from_utf8_lossy(&payload).into_owned();
                let ch = TcpChannel::new(channel, &label, self);
                *lock(&ch.link) = Some(link);
                ch.open.store(true, Ordering::SeqCst);
                lock(&self.channels).insert(channel, ch.clone());
                self.events
                    .emit(SessionEvent::IncomingChannel(ch as Arc<dyn DataChannel>));
            }
            KIND_TEXT | KIND_BINARY => {
                let open = lock(&self.channels)
                    .get(&channel)
                    .is_some_and(|c| c.is_open());
                if !open {
                    debug!(peer = %self.peer.short(), channel, "frame for unknown channel");
                    return;
                }
                let message = if kind == KIND_TEXT {
                    match String::from_utf8(payload) {
                        Ok(text) => ChannelMessage::Text(text),
                        Err(_) => {
                            debug!(peer = %self.peer.short(), channel, "non-utf8 text dropped");
                            return;
                        }
                    }
                } else {
                    ChannelMessage::Binary(payload)
                };
                self.events.emit(SessionEvent::Message { channel, message });
            }
            KIND_CLOSE => {
                let ch = lock(&self.channels).remove(&channel);
                if let Some(ch) = ch {
                    ch.shut();
                }
            }
            _ => debug!(peer = %self.peer.short(), kind, "unexpected frame kind"),
        }
    }

    /// Fail the session if no new link shows up within the connect timeout.
    fn watch_connect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let since = self.generation.load(Ordering::SeqCst);
        let limit = self.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) == since && inner.transition(SessionState::Failed) {
                warn!(peer = %inner.peer.short(), "tcp connect timed out");
                inner.close_channels();
            }
        });
    }
}

async fn write_loop(
    mut w: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    session: Weak<Inner>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Frame { bytes, accounted } => {
                if let Err(e) = w.write_all(&bytes).await {
                    debug!(error = %e, "tcp write failed");
                    break;
                }
                if let (Some((id, len)), Some(inner)) = (accounted, session.upgrade()) {
                    inner.drained(id, len);
                }
            }
            Outgoing::Shutdown => break,
        }
    }
    let _ = w.shutdown().await;
}

async fn read_loop(mut r: OwnedReadHalf, inner: Arc<Inner>, generation: u64) {
    loop {
        match read_frame(&mut r).await {
            Ok(Some(frame)) => inner.on_frame(frame),
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %inner.peer.short(), error = %e, "tcp read failed");
                break;
            }
        }
    }
    inner.link_lost(generation);
}

/// Offerer side: accept dial-ins until one presents `token`.
async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, token: String) {
    let deadline = Instant::now() + inner.connect_timeout;
    loop {
        if inner.state().is_terminal() || inner.current_link().is_some() {
            return;
        }
        let (mut stream, from) = match timeout_at(deadline, listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                warn!(error = %e, "accept failed");
                return;
            }
            Err(_) => return,
        };
        let hello = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream)).await;
        match hello {
            Ok(Ok(Some(f))) if f.kind == KIND_HELLO && f.payload == token.as_bytes() => {
                let reply = Frame::new(KIND_HELLO, 0, token.clone().into_bytes());
                if stream.write_all(&reply.encode()).await.is_err() {
                    continue;
                }
                if inner.install_link(stream) {
                    debug!(peer = %inner.peer.short(), %from, "accepted tcp link");
                }
                return;
            }
            _ => debug!(%from, "rejected dial-in"),
        }
    }
}

/// Answerer side: dial one candidate and present `token`.
async fn dial(inner: Arc<Inner>, addr: SocketAddr, token: String) {
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream
            .write_all(&Frame::new(KIND_HELLO, 0, token.clone().into_bytes()).encode())
            .await?;
        match read_frame(&mut stream).await? {
            Some(f) if f.kind == KIND_HELLO && f.payload == token.as_bytes() => Ok(stream),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "handshake rejected",
            )),
        }
    };
    match timeout(HANDSHAKE_TIMEOUT, attempt).await {
        Ok(Ok(stream)) => {
            let current = lock(&inner.dial_token).as_deref() == Some(token.as_str());
            if current && inner.install_link(stream) {
                debug!(peer = %inner.peer.short(), %addr, "dialed tcp link");
            }
        }
        Ok(Err(e)) => debug!(%addr, error = %e, "dial failed"),
        Err(_) => debug!(%addr, "dial timed out"),
    }
}

struct TcpSession(Arc<Inner>);

impl TcpSession {
    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.0.state().is_terminal() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Session for TcpSession {
    fn state(&self) -> SessionState {
        self.0.state()
    }

    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_live()?;
        let token = Uuid::new_v4().simple().to_string();
        *lock(&self.0.offer_token) = Some(token.clone());
        self.0.answered.store(false, Ordering::SeqCst);
        if self.0.current_link().is_some() {
            return Ok(SessionDescription::offer(describe(&token, None, true)));
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| SessionError::Transport(e.to_string()))?
            .port();
        if self.0.state() == SessionState::New {
            self.0.transition(SessionState::Connecting);
        }
        tokio::spawn(accept_loop(self.0.clone(), listener, token.clone()));
        self.0.watch_connect();
        for ip in local_addresses() {
            self.0
                .events
                .emit(SessionEvent::LocalCandidate(IceCandidate::new(format!(
                    "tcp {ip} {port}"
                ))));
        }
        Ok(SessionDescription::offer(describe(&token, Some(port), false)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_live()?;
        let token = lock(&self.0.remote_token)
            .take()
            .ok_or_else(|| SessionError::InvalidDescription("no remote offer".into()))?;
        if self.0.state() == SessionState::New {
            self.0.transition(SessionState::Connecting);
        }
        Ok(SessionDescription::answer(describe(&token, None, false)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        self.ensure_live()?;
        let d = parse_description(&desc.sdp)?;
        match desc.kind {
            SdpKind::Offer => {
                if d.reuse {
                    if self.0.current_link().is_none() {
                        return Err(SessionError::InvalidDescription(
                            "reuse offer without a link".into(),
                        ));
                    }
                } else {
                    self.0.detach_link();
                    debug!(peer = %self.0.peer.short(), port = ?d.port, "fresh offer, waiting for candidates");
                    *lock(&self.0.dial_token) = Some(d.token.clone());
                    self.0.watch_connect();
                }
                *lock(&self.0.remote_token) = Some(d.token);
            }
            SdpKind::Answer => {
                let expected = lock(&self.0.offer_token).clone();
                if expected.as_deref() != Some(d.token.as_str()) {
                    return Err(SessionError::InvalidDescription(
                        "answer for another offer".into(),
                    ));
                }
                self.0.answered.store(true, Ordering::SeqCst);
                self.0.open_pending();
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
        let addr = parse_candidate(&candidate.candidate)?;
        let token = lock(&self.0.dial_token).clone();
        match token {
            Some(token) if self.0.current_link().is_none() => {
                tokio::spawn(dial(self.0.clone(), addr, token));
            }
            _ => debug!(peer = %self.0.peer.short(), %addr, "candidate not needed"),
        }
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, SessionError> {
        self.ensure_live()?;
        let id = Uuid::new_v4().as_u64_pair().0;
        let ch = TcpChannel::new(id, label, &self.0);
        lock(&self.0.pending).push(ch.clone());
        Ok(ch)
    }

    async fn close(&self) {
        if !self.0.transition(SessionState::Closed) {
            return;
        }
        let link = lock(&self.0.link).take();
        if let Some(link) = link {
            let _ = link.tx.send(Outgoing::Shutdown);
        }
        self.0.close_channels();
    }
}

struct TcpChannel {
    id: ChannelId,
    label: String,
    events: SessionEvents,
    session: Weak<Inner>,
    link: Mutex<Option<Link>>,
    open: AtomicBool,
    closed: AtomicBool,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
}

impl TcpChannel {
    fn new(id: ChannelId, label: &str, session: &Arc<Inner>) -> Arc<Self> {
        Arc::new(Self {
            id,
            label: label.to_string(),
            events: session.events.clone(),
            session: Arc::downgrade(session),
            link: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
        })
    }

    /// Mark closed and report it once. Returns false if already closed.
    fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.open.store(false, Ordering::SeqCst);
        self.events.emit(SessionEvent::ChannelClosed(self.id));
        true
    }

    fn drained(&self, len: usize) {
        let before = self.buffered.fetch_sub(len, Ordering::SeqCst);
        let after = before.saturating_sub(len);
        let threshold = self.low_threshold.load(Ordering::SeqCst);
        if before > threshold && after <= threshold {
            self.events.emit(SessionEvent::BufferedAmountLow(self.id));
        }
    }
}

#[async_trait]
impl DataChannel for TcpChannel {
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
        let link = lock(&self.link).clone().ok_or(SessionError::ChannelNotOpen)?;
        let len = message.len();
        let frame = match message {
            ChannelMessage::Text(text) => Frame::new(KIND_TEXT, self.id, text.into_bytes()),
            ChannelMessage::Binary(bytes) => Frame::new(KIND_BINARY, self.id, bytes),
        };
        if frame.payload.len() > MAX_FRAME {
            return Err(SessionError::Transport(format!(
                "message of {} bytes too large",
                frame.payload.len()
            )));
        }
        self.buffered.fetch_add(len, Ordering::SeqCst);
        if !link.send(&frame, Some((self.id, len))) {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    async fn close(&self) {
        let was_open = self.is_open();
        if !self.shut() {
            return;
        }
        if was_open {
            if let Some(link) = lock(&self.link).take() {
                link.send(&Frame::new(KIND_CLOSE, self.id, Vec::new()), None);
            }
        }
        if let Some(session) = self.session.upgrade() {
            lock(&session.channels).remove(&self.id);
            lock(&session.pending).retain(|c| c.id != self.id);
        }
    }
}
