//! Sender side: drains the send queue one item at a time.
//!
//! Each item gets its own data channel. The worker asks the node to open the
//! channel and negotiate, then drives the stream from the events the node
//! routes back for that channel. Every wait is bounded.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::chunk::ChunkReader;
use crate::config::NodeConfig;
use crate::core::{Command, NodeEvent};
use crate::identity::PeerId;
use crate::protocol::{FileInfo, OfferFileInfo, StreamFrame, TransferKind};
use crate::session::{ChannelMessage, DataChannel};
use crate::transfer::queue::{Payload, SendQueueItem};
use crate::transfer::{
    Direction, ProgressThrottle, StreamKey, Transfer, TransferError, TransferOutcome,
};
use crate::wire;

/// What the node forwards to the worker about its channel.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Open,
    Frame(StreamFrame),
    BufferedLow,
    Closed,
    /// `transfer-complete` arrived from the receiver.
    Completed,
    SessionLost(String),
}

pub(crate) struct OpenRequest {
    pub peer: PeerId,
    pub name: String,
    pub transfer_type: TransferKind,
    pub file_info: Option<OfferFileInfo>,
}

pub(crate) struct OutboundStream {
    pub key: StreamKey,
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

enum Body {
    Text(String),
    File(ChunkReader),
}

struct ActiveStream {
    key: StreamKey,
    channel: Arc<dyn DataChannel>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    /// Set once the last frame of the item was handed to the channel.
    last_frame_sent: bool,
    completed: bool,
}

impl ActiveStream {
    fn new(stream: OutboundStream) -> Self {
        Self {
            key: stream.key,
            channel: stream.channel,
            events: stream.events,
            last_frame_sent: false,
            completed: false,
        }
    }

    /// A completion can only be genuine once everything was sent.
    fn on_completed(&mut self) {
        if self.last_frame_sent {
            self.completed = true;
        } else {
            debug!(peer = %self.key.peer.short(), channel = self.key.channel, "completion before the last frame, ignored");
        }
    }

    /// Next event before `deadline`, `None` on timeout.
    async fn next_before(&mut self, deadline: Instant) -> Result<Option<StreamEvent>, TransferError> {
        match timeout_at(deadline, self.events.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(TransferError::NodeStopped),
            Ok(Some(StreamEvent::Completed)) => {
                self.on_completed();
                Ok(Some(StreamEvent::Completed))
            }
            Ok(Some(event)) => Ok(Some(event)),
        }
    }

    async fn wait_open(&mut self, limit: Duration) -> Result<(), TransferError> {
        if self.channel.is_open() {
            return Ok(());
        }
        let deadline = Instant::now() + limit;
        loop {
            match self.next_before(deadline).await? {
                Some(StreamEvent::Open) => return Ok(()),
                Some(StreamEvent::Closed) => return Err(TransferError::ChannelClosed),
                Some(StreamEvent::SessionLost(reason)) => {
                    return Err(TransferError::SessionFailed(reason))
                }
                Some(_) => {}
                None if self.channel.is_open() => return Ok(()),
                None => return Err(TransferError::ConnectTimeout),
            }
        }
    }

    async fn wait_ack(&mut self, limit: Duration) -> Result<(), TransferError> {
        let deadline = Instant::now() + limit;
        loop {
            match self.next_before(deadline).await? {
                Some(StreamEvent::Frame(StreamFrame::AckTransfer)) => return Ok(()),
                Some(StreamEvent::Frame(other)) => {
                    debug!(peer = %self.key.peer.short(), frame = ?other, "unexpected frame while waiting for ack")
                }
                Some(StreamEvent::Closed) => return Err(TransferError::ChannelClosed),
                Some(StreamEvent::SessionLost(reason)) => {
                    return Err(TransferError::SessionFailed(reason))
                }
                Some(_) => {}
                None => return Err(TransferError::AckTimeout),
            }
        }
    }

    /// Handle whatever arrived while chunks were being written.
    fn drain_events(&mut self) -> Result<(), TransferError> {
        loop {
            match self.events.try_recv() {
                Ok(StreamEvent::Closed) => return Err(TransferError::ChannelClosed),
                Ok(StreamEvent::SessionLost(reason)) => {
                    return Err(TransferError::SessionFailed(reason))
                }
                Ok(StreamEvent::Completed) => self.on_completed(),
                Ok(_) => {}
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(TransferError::NodeStopped)
                }
            }
        }
    }

    /// Above the high-water mark, wait for the buffer to drain below the
    /// low-water mark. If the drain notification never comes, resume after
    /// `limit` as long as the channel is still open.
    async fn relieve_backpressure(&mut self, config: &NodeConfig) -> Result<(), TransferError> {
        if self.channel.buffered_amount() <= config.high_water_mark {
            return Ok(());
        }
        let deadline = Instant::now() + config.backpressure_timeout;
        while self.channel.buffered_amount() > config.low_water_mark {
            match self.next_before(deadline).await? {
                Some(StreamEvent::Closed) => return Err(TransferError::ChannelClosed),
                Some(StreamEvent::SessionLost(reason)) => {
                    return Err(TransferError::SessionFailed(reason))
                }
                Some(_) => {}
                None if self.channel.is_open() => {
                    debug!(
                        peer = %self.key.peer.short(),
                        buffered = self.channel.buffered_amount(),
                        "no drain notification, resuming"
                    );
                    return Ok(());
                }
                None => return Err(TransferError::ChannelClosed),
            }
        }
        Ok(())
    }

    /// Wait for `transfer-complete`. False when it never came.
    async fn wait_completion(&mut self, limit: Duration) -> bool {
        if self.completed {
            return true;
        }
        let deadline = Instant::now() + limit;
        loop {
            match self.next_before(deadline).await {
                Ok(Some(StreamEvent::Completed)) if self.completed => return true,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return false,
            }
        }
    }

    async fn send_frame(&self, frame: &StreamFrame) -> Result<(), TransferError> {
        let text = wire::encode_frame(frame).map_err(|e| TransferError::Protocol(e.to_string()))?;
        self.channel
            .send(ChannelMessage::Text(text))
            .await
            .map_err(|_| TransferError::ChannelClosed)
    }
}

pub(crate) struct SenderWorker {
    config: NodeConfig,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<NodeEvent>,
    queue: mpsc::UnboundedReceiver<SendQueueItem>,
    shutdown: watch::Receiver<bool>,
}

impl SenderWorker {
    pub(crate) fn new(
        config: NodeConfig,
        commands: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedSender<NodeEvent>,
        queue: mpsc::UnboundedReceiver<SendQueueItem>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            commands,
            events,
            queue,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let item = tokio::select! {
                item = self.queue.recv() => item,
                _ = self.shutdown.changed() => None,
            };
            let Some(item) = item else {
                break;
            };
            self.send_item(item).await;
            if *self.shutdown.borrow() {
                break;
            }
            tokio::time::sleep(self.config.queue_cooldown).await;
        }
        debug!("sender worker stopped");
    }

    async fn send_item(&self, item: SendQueueItem) -> TransferOutcome {
        let SendQueueItem {
            id,
            target,
            payload,
            batch_index,
            batch_total,
        } = item;
        let kind = payload.kind();
        let name = payload.name().to_string();
        let (body, mime_type, size) = match payload {
            Payload::Text(content) => {
                let size = content.len() as u64;
                (Ok(Body::Text(content)), "text/plain".to_string(), size)
            }
            Payload::File {
                mime_type, source, ..
            } => match ChunkReader::open(source, self.config.chunk_size).await {
                Ok(reader) => {
                    let size = reader.total_len();
                    (Ok(Body::File(reader)), mime_type, size)
                }
                Err(e) => (Err(TransferError::Source(e.to_string())), mime_type, 0),
            },
        };
        let mut transfer = Transfer::new(
            id,
            target,
            kind,
            name,
            size,
            mime_type,
            Direction::Outbound,
        )
        .with_batch(batch_index, batch_total);
        let _ = self.events.send(NodeEvent::started(&transfer));
        info!(
            id,
            peer = %transfer.peer.short(),
            name = %transfer.name,
            size,
            "sending"
        );

        let result = match body {
            Ok(body) => self.deliver(&mut transfer, body).await,
            Err(e) => Err(e),
        };
        let outcome = match result {
            Ok(acknowledged) => {
                transfer.observe(transfer.total_size);
                let _ = self.events.send(NodeEvent::progress(&transfer));
                if !acknowledged {
                    warn!(id, peer = %transfer.peer.short(), "no completion signal, assuming delivered");
                }
                TransferOutcome::Delivered { acknowledged }
            }
            Err(e) => {
                warn!(id, peer = %transfer.peer.short(), error = %e, "send failed");
                TransferOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        let _ = self
            .events
            .send(NodeEvent::finished(&transfer, outcome.clone()));
        outcome
    }

    async fn deliver(&self, transfer: &mut Transfer, body: Body) -> Result<bool, TransferError> {
        let file_info = match &body {
            Body::Text(_) => None,
            Body::File(_) => Some(OfferFileInfo {
                name: transfer.name.clone(),
                size: transfer.total_size,
                mime_type: transfer.mime_type.clone(),
            }),
        };
        let mut stream = self
            .open(OpenRequest {
                peer: transfer.peer.clone(),
                name: transfer.name.clone(),
                transfer_type: transfer.kind,
                file_info,
            })
            .await?;
        let result = self.drive(&mut stream, transfer, body).await;
        if result.is_err() {
            stream.channel.close().await;
        }
        let _ = self.commands.send(Command::CloseStream(stream.key.clone()));
        result
    }

    async fn open(&self, request: OpenRequest) -> Result<ActiveStream, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::OpenStream { request, reply })
            .map_err(|_| TransferError::NodeStopped)?;
        let stream = rx.await.map_err(|_| TransferError::NodeStopped)??;
        Ok(ActiveStream::new(stream))
    }

    async fn drive(
        &self,
        stream: &mut ActiveStream,
        transfer: &mut Transfer,
        body: Body,
    ) -> Result<bool, TransferError> {
        let config = &self.config;
        stream.wait_open(config.connect_timeout).await?;
        match body {
            Body::Text(content) => {
                stream.send_frame(&StreamFrame::Text { content }).await?;
                stream.last_frame_sent = true;
            }
            Body::File(reader) => {
                stream
                    .send_frame(&StreamFrame::FileInfo(FileInfo {
                        name: transfer.name.clone(),
                        size: transfer.total_size,
                        file_type: transfer.mime_type.clone(),
                        batch_index: transfer.batch_index,
                        batch_total: transfer.batch_total,
                    }))
                    .await?;
                stream.last_frame_sent = transfer.total_size == 0;
                stream.wait_ack(config.ack_timeout).await?;
                debug!(id = transfer.id, "receiver accepted");
                self.stream_chunks(stream, transfer, reader).await?;
            }
        }
        Ok(stream.wait_completion(config.completion_timeout).await)
    }

    async fn stream_chunks(
        &self,
        stream: &mut ActiveStream,
        transfer: &mut Transfer,
        mut reader: ChunkReader,
    ) -> Result<(), TransferError> {
        let config = &self.config;
        stream
            .channel
            .set_buffered_amount_low_threshold(config.low_water_mark);
        let mut throttle = ProgressThrottle::new(config.progress_interval);
        let mut sent: u64 = 0;
        while let Some(chunk) = reader
            .next_chunk()
            .await
            .map_err(|e| TransferError::Source(e.to_string()))?
        {
            stream.drain_events()?;
            stream.relieve_backpressure(config).await?;
            let len = chunk.len() as u64;
            stream
                .channel
                .send(ChannelMessage::Binary(chunk))
                .await
                .map_err(|_| TransferError::ChannelClosed)?;
            sent += len;
            if throttle.ready() {
                let buffered = stream.channel.buffered_amount() as u64;
                transfer.observe(sent.saturating_sub(buffered));
                let _ = self.events.send(NodeEvent::progress(transfer));
            }
        }
        stream.last_frame_sent = true;
        debug!(id = transfer.id, bytes = sent, "all chunks handed to the channel");
        Ok(())
    }
}
