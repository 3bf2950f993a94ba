//! Receiver side: inbound stream table and admission.
//!
//! The first message on a new channel decides what the stream is. A text
//! frame is delivered at once. A `file-info` frame asks for admission; the
//! stream is acknowledged with `ack-transfer` only once admitted, and bytes
//! are accumulated until the declared size is reached. Saving runs off the
//! node task; the sender's lock is held until the save reports back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chunk::ChunkAssembler;
use crate::core::NodeEvent;
use crate::identity::PeerId;
use crate::persist::{PersistError, Persistence, SavedFile};
use crate::protocol::{FileInfo, StreamFrame, TransferKind};
use crate::session::{ChannelMessage, DataChannel};
use crate::signaling::{Signal, SignalingRelay};
use crate::transfer::admission::{Admission, AdmissionQueue};
use crate::transfer::{
    Direction, ProgressThrottle, StreamKey, Transfer, TransferError, TransferIds, TransferOutcome,
};
use crate::wire;

enum Phase {
    AwaitingMetadata,
    Parked(FileInfo),
    Receiving(Box<Receiving>),
}

struct Receiving {
    transfer: Transfer,
    assembler: ChunkAssembler,
    throttle: ProgressThrottle,
}

struct InboundStream {
    channel: Arc<dyn DataChannel>,
    phase: Phase,
}

/// A save that ran to completion, handed back to the node task.
pub struct FinishedSave {
    key: StreamKey,
    channel: Arc<dyn DataChannel>,
    transfer: Transfer,
    result: Result<SavedFile, PersistError>,
}

pub struct InboundStreams {
    relay: Arc<SignalingRelay>,
    persistence: Arc<dyn Persistence>,
    events: mpsc::UnboundedSender<NodeEvent>,
    ids: TransferIds,
    consolidate_threshold: usize,
    progress_interval: Duration,
    streams: HashMap<StreamKey, InboundStream>,
    admission: AdmissionQueue<StreamKey>,
    saving: HashSet<StreamKey>,
    saved_tx: mpsc::UnboundedSender<FinishedSave>,
    saved_rx: mpsc::UnboundedReceiver<FinishedSave>,
}

impl InboundStreams {
    pub fn new(
        relay: Arc<SignalingRelay>,
        persistence: Arc<dyn Persistence>,
        events: mpsc::UnboundedSender<NodeEvent>,
        ids: TransferIds,
        consolidate_threshold: usize,
        progress_interval: Duration,
    ) -> Self {
        let (saved_tx, saved_rx) = mpsc::unbounded_channel();
        Self {
            relay,
            persistence,
            events,
            ids,
            consolidate_threshold,
            progress_interval,
            streams: HashMap::new(),
            admission: AdmissionQueue::new(),
            saving: HashSet::new(),
            saved_tx,
            saved_rx,
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.streams.contains_key(key)
    }

    pub fn admission(&self) -> &AdmissionQueue<StreamKey> {
        &self.admission
    }

    /// Number of saves still running.
    pub fn saving(&self) -> usize {
        self.saving.len()
    }

    /// Next finished save. Pending forever while none is running.
    pub async fn next_saved(&mut self) -> FinishedSave {
        match self.saved_rx.recv().await {
            Some(done) => done,
            None => std::future::pending().await,
        }
    }

    /// Report a finished save: signal the sender, close the channel and hand
    /// the lock to the next sender.
    pub async fn on_saved(&mut self, done: FinishedSave) {
        let FinishedSave {
            key,
            channel,
            transfer,
            result,
        } = done;
        self.saving.remove(&key);
        let outcome = match result {
            Ok(saved) => {
                info!(peer = %key.peer.short(), name = %transfer.name, location = %saved.location, bytes = saved.size, "file received");
                TransferOutcome::Received {
                    saved_to: Some(saved.location),
                }
            }
            Err(e) => {
                warn!(peer = %key.peer.short(), name = %transfer.name, error = %e, "saving failed");
                TransferOutcome::Failed {
                    reason: TransferError::Persist(e.to_string()).to_string(),
                }
            }
        };
        self.signal_complete(&key, Some(transfer.name.clone())).await;
        channel.close().await;
        let _ = self.events.send(NodeEvent::finished(&transfer, outcome));
        let granted = self.admission.release(&key.peer);
        self.start_admitted(granted).await;
    }

    pub fn on_incoming_channel(&mut self, key: StreamKey, channel: Arc<dyn DataChannel>) {
        debug!(peer = %key.peer.short(), channel = key.channel, label = channel.label(), "inbound channel");
        self.streams.insert(
            key,
            InboundStream {
                channel,
                phase: Phase::AwaitingMetadata,
            },
        );
    }

    pub async fn on_message(&mut self, key: &StreamKey, message: ChannelMessage) {
        let awaiting = match self.streams.get(key) {
            Some(stream) => matches!(stream.phase, Phase::AwaitingMetadata),
            None => {
                debug!(peer = %key.peer.short(), channel = key.channel, "message on unknown channel");
                return;
            }
        };
        match message {
            ChannelMessage::Text(text) => {
                let frame = match wire::decode_frame(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(peer = %key.peer.short(), error = %e, "dropping malformed frame");
                        return;
                    }
                };
                match frame {
                    StreamFrame::Text { content } if awaiting => {
                        self.deliver_text(key, content).await
                    }
                    StreamFrame::FileInfo(info) if awaiting => self.on_metadata(key, info).await,
                    other => {
                        debug!(peer = %key.peer.short(), frame = ?other, "unexpected frame ignored")
                    }
                }
            }
            ChannelMessage::Binary(bytes) => self.on_chunk(key, bytes).await,
        }
    }

    pub async fn on_channel_closed(&mut self, key: &StreamKey) {
        if !self.streams.contains_key(key) {
            return;
        }
        let granted = self.fail(key, TransferError::ChannelClosed).await;
        self.start_admitted(granted).await;
    }

    /// Fail every stream of one session generation.
    pub async fn on_session_lost(&mut self, peer: &PeerId, session_id: u64, reason: &str) {
        let keys: Vec<StreamKey> = self
            .streams
            .keys()
            .filter(|k| k.peer == *peer && k.session_id == session_id)
            .cloned()
            .collect();
        let mut granted = Vec::new();
        for key in keys {
            granted.extend(
                self.fail(&key, TransferError::SessionFailed(reason.to_string()))
                    .await,
            );
        }
        let busy = self
            .streams
            .keys()
            .chain(self.saving.iter())
            .any(|k| k.peer == *peer);
        if !busy {
            granted.extend(self.admission.remove_peer(peer));
        }
        self.start_admitted(granted).await;
    }

    pub async fn close_all(&mut self) {
        for (_, stream) in self.streams.drain() {
            stream.channel.close().await;
        }
    }

    async fn deliver_text(&mut self, key: &StreamKey, content: String) {
        let Some(stream) = self.streams.remove(key) else {
            return;
        };
        info!(peer = %key.peer.short(), bytes = content.len(), "text received");
        let _ = self.events.send(NodeEvent::TextReceived {
            peer: key.peer.clone(),
            content,
        });
        self.signal_complete(key, None).await;
        stream.channel.close().await;
    }

    async fn on_metadata(&mut self, key: &StreamKey, info: FileInfo) {
        info!(
            peer = %key.peer.short(),
            name = %info.name,
            size = info.size,
            "incoming file"
        );
        let admission = self.admission.request(&key.peer, key.clone());
        if let Some(stream) = self.streams.get_mut(key) {
            stream.phase = Phase::Parked(info);
        }
        match admission {
            Admission::Granted => self.start_admitted(vec![key.clone()]).await,
            Admission::Queued(position) => {
                info!(peer = %key.peer.short(), position, "busy with another sender, request queued")
            }
        }
    }

    async fn on_chunk(&mut self, key: &StreamKey, bytes: Vec<u8>) {
        let Some(stream) = self.streams.get_mut(key) else {
            return;
        };
        let Phase::Receiving(rx) = &mut stream.phase else {
            debug!(peer = %key.peer.short(), bytes = bytes.len(), "binary before metadata dropped");
            return;
        };
        let accepted = rx
            .transfer
            .advance(bytes.len() as u64)
            .and_then(|_| {
                rx.assembler
                    .push(&bytes)
                    .map_err(|e| TransferError::Protocol(e.to_string()))
            });
        let done = match accepted {
            Ok(done) => done,
            Err(e) => {
                warn!(peer = %key.peer.short(), error = %e, "inbound stream rejected");
                let granted = self.fail(key, e).await;
                self.start_admitted(granted).await;
                return;
            }
        };
        if !done && rx.throttle.ready() {
            let _ = self.events.send(NodeEvent::progress(&rx.transfer));
        }
        if done {
            self.finalize(key);
        }
    }

    /// Acknowledge admitted streams in order. A stream that completes on the
    /// spot (zero bytes) releases the lock and may admit more.
    async fn start_admitted(&mut self, keys: Vec<StreamKey>) {
        let mut work: VecDeque<StreamKey> = keys.into();
        while let Some(key) = work.pop_front() {
            work.extend(self.begin(&key).await);
        }
    }

    async fn begin(&mut self, key: &StreamKey) -> Vec<StreamKey> {
        let Some(stream) = self.streams.get_mut(key) else {
            return self.admission.release(&key.peer);
        };
        let info = match std::mem::replace(&mut stream.phase, Phase::AwaitingMetadata) {
            Phase::Parked(info) => info,
            other => {
                stream.phase = other;
                return Vec::new();
            }
        };
        let channel = stream.channel.clone();
        let transfer = Transfer::new(
            self.ids.next(),
            key.peer.clone(),
            TransferKind::File,
            info.name,
            info.size,
            info.file_type,
            Direction::Inbound,
        )
        .with_batch(info.batch_index, info.batch_total);

        let ack = match wire::encode_frame(&StreamFrame::AckTransfer) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(error = %e, "cannot encode ack");
                return self.drop_admitted(key).await;
            }
        };
        if let Err(e) = channel.send(ChannelMessage::Text(ack)).await {
            warn!(peer = %key.peer.short(), error = %e, "cannot acknowledge transfer");
            return self.drop_admitted(key).await;
        }
        debug!(peer = %key.peer.short(), id = transfer.id, "transfer acknowledged");
        let _ = self.events.send(NodeEvent::started(&transfer));
        let empty = transfer.total_size == 0;
        if let Some(stream) = self.streams.get_mut(key) {
            stream.phase = Phase::Receiving(Box::new(Receiving {
                assembler: ChunkAssembler::new(transfer.total_size, self.consolidate_threshold),
                throttle: ProgressThrottle::new(self.progress_interval),
                transfer,
            }));
        }
        if empty {
            self.finalize(key);
        }
        Vec::new()
    }

    async fn drop_admitted(&mut self, key: &StreamKey) -> Vec<StreamKey> {
        if let Some(stream) = self.streams.remove(key) {
            stream.channel.close().await;
        }
        self.admission.release(&key.peer)
    }

    /// All bytes are in: start the save. The lock stays held until
    /// [`InboundStreams::on_saved`].
    fn finalize(&mut self, key: &StreamKey) {
        let Some(stream) = self.streams.remove(key) else {
            return;
        };
        let Phase::Receiving(rx) = stream.phase else {
            return;
        };
        let Receiving {
            transfer,
            assembler,
            ..
        } = *rx;
        let _ = self.events.send(NodeEvent::progress(&transfer));
        let bytes = assembler.finish();
        debug!(peer = %key.peer.short(), name = %transfer.name, bytes = bytes.len(), "saving");
        self.saving.insert(key.clone());
        let persistence = self.persistence.clone();
        let saved_tx = self.saved_tx.clone();
        let key = key.clone();
        let channel = stream.channel;
        tokio::spawn(async move {
            let result = persistence
                .save(bytes, &transfer.name, &transfer.mime_type)
                .await;
            let _ = saved_tx.send(FinishedSave {
                key,
                channel,
                transfer,
                result,
            });
        });
    }

    async fn fail(&mut self, key: &StreamKey, error: TransferError) -> Vec<StreamKey> {
        let Some(stream) = self.streams.remove(key) else {
            return Vec::new();
        };
        match stream.phase {
            Phase::AwaitingMetadata => Vec::new(),
            Phase::Parked(info) => {
                debug!(peer = %key.peer.short(), name = %info.name, "queued request withdrawn");
                self.admission.remove(key);
                Vec::new()
            }
            Phase::Receiving(rx) => {
                warn!(peer = %key.peer.short(), name = %rx.transfer.name, error = %error, "inbound transfer failed");
                stream.channel.close().await;
                let _ = self.events.send(NodeEvent::finished(
                    &rx.transfer,
                    TransferOutcome::Failed {
                        reason: error.to_string(),
                    },
                ));
                self.admission.release(&key.peer)
            }
        }
    }

    async fn signal_complete(&self, key: &StreamKey, name: Option<String>) {
        let signal = Signal::TransferComplete {
            name,
            channel: Some(key.channel),
        };
        if let Err(e) = self.relay.send(&key.peer, signal).await {
            warn!(peer = %key.peer.short(), error = %e, "cannot send completion signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryPersistence};
    use crate::protocol::Envelope;
    use crate::rendezvous::{PubSub, RendezvousChannel, RendezvousMessage};
    use crate::session::{ChannelId, SessionError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeChannel {
        id: ChannelId,
        sent: Mutex<Vec<ChannelMessage>>,
        closed: AtomicBool,
    }

    impl FakeChannel {
        fn new(id: ChannelId) -> Arc<Self> {
            Arc::new(Self {
                id,
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        fn acked(&self) -> bool {
            self.sent.lock().unwrap().iter().any(|m| {
                matches!(m, ChannelMessage::Text(t) if t.contains("ack-transfer"))
            })
        }
    }

    #[async_trait]
    impl DataChannel for FakeChannel {
        fn id(&self) -> ChannelId {
            self.id
        }
        fn label(&self) -> &str {
            "fake"
        }
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
        fn buffered_amount(&self) -> usize {
            0
        }
        fn set_buffered_amount_low_threshold(&self, _threshold: usize) {}
        async fn send(&self, message: ChannelMessage) -> Result<(), SessionError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        streams: InboundStreams,
        persistence: Arc<MemoryPersistence>,
        events: mpsc::UnboundedReceiver<NodeEvent>,
        signals: mpsc::UnboundedReceiver<RendezvousMessage>,
    }

    impl Harness {
        /// Wait for one save to finish and report it.
        async fn settle(&mut self) {
            let done = self.streams.next_saved().await;
            self.streams.on_saved(done).await;
        }
    }

    async fn harness() -> Harness {
        let broker = MemoryBroker::new();
        let (pubsub, _rx) = broker.client();
        let (listener, signals) = broker.client();
        for peer in ["a", "b"] {
            listener
                .subscribe(&format!("localdrop/v1/room/{peer}"))
                .await
                .unwrap();
        }
        let me = PeerId::new("me");
        let channel = Arc::new(RendezvousChannel::new("room", me.clone(), pubsub).unwrap());
        let relay = Arc::new(SignalingRelay::new(me, channel));
        let persistence = Arc::new(MemoryPersistence::new());
        let (tx, events) = mpsc::unbounded_channel();
        let streams = InboundStreams::new(
            relay,
            persistence.clone(),
            tx,
            TransferIds::default(),
            8,
            Duration::from_millis(100),
        );
        Harness {
            streams,
            persistence,
            events,
            signals,
        }
    }

    fn key(peer: &str, channel: ChannelId) -> StreamKey {
        StreamKey {
            peer: PeerId::new(peer),
            session_id: 1,
            channel,
        }
    }

    fn file_info(name: &str, size: u64) -> ChannelMessage {
        ChannelMessage::Text(
            wire::encode_frame(&StreamFrame::FileInfo(FileInfo {
                name: name.into(),
                size,
                file_type: "application/octet-stream".into(),
                batch_index: None,
                batch_total: None,
            }))
            .unwrap(),
        )
    }

    fn completion_target(msg: &RendezvousMessage) -> PeerId {
        match wire::decode_envelope(&msg.payload).unwrap() {
            Envelope::TransferComplete { target, .. } => target,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_received_and_saved() {
        let mut h = harness().await;
        let ch = FakeChannel::new(1);
        let k = key("a", 1);
        h.streams.on_incoming_channel(k.clone(), ch.clone());
        h.streams.on_message(&k, ChannelMessage::Binary(vec![9; 3])).await;
        h.streams.on_message(&k, file_info("f.bin", 20)).await;
        assert!(ch.acked());
        for part in [vec![1u8; 8], vec![2u8; 8], vec![3u8; 4]] {
            h.streams.on_message(&k, ChannelMessage::Binary(part)).await;
        }
        assert_eq!(h.streams.saving(), 1);
        h.settle().await;
        assert_eq!(h.streams.saving(), 0);
        let items = h.persistence.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "f.bin");
        assert_eq!(
            items[0].bytes,
            [vec![1u8; 8], vec![2u8; 8], vec![3u8; 4]].concat()
        );
        assert!(!ch.is_open());
        assert!(h.streams.is_empty());
        assert_eq!(completion_target(&h.signals.recv().await.unwrap()), PeerId::new("a"));
        let mut finished = false;
        while let Ok(ev) = h.events.try_recv() {
            if let NodeEvent::TransferFinished { outcome, .. } = ev {
                assert!(matches!(outcome, TransferOutcome::Received { .. }));
                finished = true;
            }
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn second_sender_waits_for_first() {
        let mut h = harness().await;
        let (ch_a, ch_b) = (FakeChannel::new(1), FakeChannel::new(2));
        let (ka, kb) = (key("a", 1), key("b", 2));
        h.streams.on_incoming_channel(ka.clone(), ch_a.clone());
        h.streams.on_incoming_channel(kb.clone(), ch_b.clone());
        h.streams.on_message(&ka, file_info("a.bin", 4)).await;
        h.streams.on_message(&kb, file_info("b.bin", 4)).await;
        assert!(ch_a.acked());
        assert!(!ch_b.acked());
        assert_eq!(h.streams.admission().waiting(), 1);

        h.streams.on_message(&ka, ChannelMessage::Binary(vec![0; 4])).await;
        h.settle().await;
        assert!(ch_b.acked());
        assert_eq!(h.streams.admission().holder(), Some(&PeerId::new("b")));
        h.streams.on_message(&kb, ChannelMessage::Binary(vec![1; 4])).await;
        h.settle().await;
        let names: Vec<String> = h.persistence.items().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["a.bin", "b.bin"]);
    }

    #[tokio::test]
    async fn overflow_fails_and_releases() {
        let mut h = harness().await;
        let (ch_a, ch_b) = (FakeChannel::new(1), FakeChannel::new(2));
        let (ka, kb) = (key("a", 1), key("b", 2));
        h.streams.on_incoming_channel(ka.clone(), ch_a.clone());
        h.streams.on_incoming_channel(kb.clone(), ch_b.clone());
        h.streams.on_message(&ka, file_info("a.bin", 4)).await;
        h.streams.on_message(&kb, file_info("b.bin", 4)).await;
        h.streams.on_message(&ka, ChannelMessage::Binary(vec![0; 5])).await;
        assert!(!ch_a.is_open());
        assert!(ch_b.acked());
        assert!(h.persistence.items().is_empty());
    }

    #[tokio::test]
    async fn closed_parked_request_is_withdrawn() {
        let mut h = harness().await;
        let (ch_a, ch_b) = (FakeChannel::new(1), FakeChannel::new(2));
        let (ka, kb) = (key("a", 1), key("b", 2));
        h.streams.on_incoming_channel(ka.clone(), ch_a.clone());
        h.streams.on_incoming_channel(kb.clone(), ch_b.clone());
        h.streams.on_message(&ka, file_info("a.bin", 4)).await;
        h.streams.on_message(&kb, file_info("b.bin", 4)).await;
        h.streams.on_channel_closed(&kb).await;
        assert_eq!(h.streams.admission().waiting(), 0);
        h.streams.on_message(&ka, ChannelMessage::Binary(vec![0; 4])).await;
        h.settle().await;
        assert!(h.streams.admission().holder().is_none());
        assert!(!ch_b.acked());
    }

    #[tokio::test]
    async fn session_loss_admits_next() {
        let mut h = harness().await;
        let (ch_a, ch_b) = (FakeChannel::new(1), FakeChannel::new(2));
        let (ka, kb) = (key("a", 1), key("b", 2));
        h.streams.on_incoming_channel(ka.clone(), ch_a);
        h.streams.on_incoming_channel(kb.clone(), ch_b.clone());
        h.streams.on_message(&ka, file_info("a.bin", 4)).await;
        h.streams.on_message(&kb, file_info("b.bin", 4)).await;
        h.streams.on_session_lost(&PeerId::new("a"), 1, "failed").await;
        assert!(ch_b.acked());
        assert!(!h.streams.contains(&ka));
    }

    #[tokio::test]
    async fn zero_byte_file_and_text() {
        let mut h = harness().await;
        let ch = FakeChannel::new(1);
        let k = key("a", 1);
        h.streams.on_incoming_channel(k.clone(), ch.clone());
        h.streams.on_message(&k, file_info("empty", 0)).await;
        h.settle().await;
        assert_eq!(h.persistence.items()[0].bytes.len(), 0);
        assert!(h.streams.admission().holder().is_none());

        let ch2 = FakeChannel::new(2);
        let k2 = key("b", 2);
        h.streams.on_incoming_channel(k2.clone(), ch2.clone());
        let text = wire::encode_frame(&StreamFrame::Text {
            content: "hello".into(),
        })
        .unwrap();
        h.streams.on_message(&k2, ChannelMessage::Text(text)).await;
        assert!(!ch2.is_open());
        let mut got_text = false;
        while let Ok(ev) = h.events.try_recv() {
            if let NodeEvent::TextReceived { content, peer } = ev {
                assert_eq!(content, "hello");
                assert_eq!(peer, PeerId::new("b"));
                got_text = true;
            }
        }
        assert!(got_text);
        assert_eq!(completion_target(&h.signals.recv().await.unwrap()), PeerId::new("a"));
        assert_eq!(completion_target(&h.signals.recv().await.unwrap()), PeerId::new("b"));
    }

    #[tokio::test]
    async fn persistence_failure_still_signals() {
        let mut h = harness().await;
        h.persistence.set_failing(true);
        let ch = FakeChannel::new(1);
        let k = key("a", 1);
        h.streams.on_incoming_channel(k.clone(), ch);
        h.streams.on_message(&k, file_info("f", 2)).await;
        h.streams.on_message(&k, ChannelMessage::Binary(vec![0; 2])).await;
        h.settle().await;
        assert!(h.signals.recv().await.is_some());
        let mut failed = false;
        while let Ok(ev) = h.events.try_recv() {
            if let NodeEvent::TransferFinished { outcome, .. } = ev {
                failed = matches!(outcome, TransferOutcome::Failed { .. });
            }
        }
        assert!(failed);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_save_keeps_lock_but_not_the_loop() {
        let mut h = harness().await;
        h.persistence.set_delay(Duration::from_secs(15));
        let (ch_a, ch_b) = (FakeChannel::new(1), FakeChannel::new(2));
        let (ka, kb) = (key("a", 1), key("b", 2));
        h.streams.on_incoming_channel(ka.clone(), ch_a.clone());
        h.streams.on_message(&ka, file_info("a.bin", 4)).await;
        h.streams.on_message(&ka, ChannelMessage::Binary(vec![0; 4])).await;
        assert!(ch_a.is_open());
        assert!(h.persistence.items().is_empty());

        // Another sender is still served while the save runs.
        h.streams.on_incoming_channel(kb.clone(), ch_b.clone());
        let text = wire::encode_frame(&StreamFrame::Text {
            content: "hi".into(),
        })
        .unwrap();
        h.streams.on_message(&kb, ChannelMessage::Text(text)).await;
        assert_eq!(completion_target(&h.signals.recv().await.unwrap()), PeerId::new("b"));

        // Losing the session mid-save does not drop the lock early.
        h.streams.on_session_lost(&PeerId::new("a"), 1, "failed").await;
        assert_eq!(h.streams.admission().holder(), Some(&PeerId::new("a")));

        h.settle().await;
        assert_eq!(h.persistence.items().len(), 1);
        assert!(!ch_a.is_open());
        assert!(h.streams.admission().holder().is_none());
        match wire::decode_envelope(&h.signals.recv().await.unwrap().payload).unwrap() {
            Envelope::TransferComplete {
                target,
                name,
                channel,
                ..
            } => {
                assert_eq!(target, PeerId::new("a"));
                assert_eq!(name.as_deref(), Some("a.bin"));
                assert_eq!(channel, Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
