//! Transfer protocol engine: per-stream state shared by the sender worker and
//! the inbound stream table.

pub mod admission;
pub mod queue;
pub mod receiver;
pub mod sender;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::identity::PeerId;
use crate::protocol::TransferKind;
use crate::session::ChannelId;

/// Process-local transfer identifier used in notifications.
pub type TransferId = u64;

/// Monotonic transfer id source shared by handles and the node.
#[derive(Debug, Clone, Default)]
pub struct TransferIds(Arc<AtomicU64>);

impl TransferIds {
    pub fn next(&self) -> TransferId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// One data channel of one session generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub peer: PeerId,
    pub session_id: u64,
    pub channel: ChannelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

/// Terminal result of one transfer, reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Sender side. `acknowledged` is false when the completion signal never
    /// arrived and the transfer resolved on timeout.
    Delivered { acknowledged: bool },
    /// Receiver side.
    Received { saved_to: Option<String> },
    Failed { reason: String },
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, TransferOutcome::Failed { .. })
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Delivered { acknowledged: true } => f.write_str("delivered"),
            TransferOutcome::Delivered {
                acknowledged: false,
            } => f.write_str("delivered (not acknowledged)"),
            TransferOutcome::Received {
                saved_to: Some(path),
            } => write!(f, "saved to {path}"),
            TransferOutcome::Received { saved_to: None } => f.write_str("received"),
            TransferOutcome::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("timed out waiting for the data channel to open")]
    ConnectTimeout,
    #[error("receiver did not accept the transfer in time")]
    AckTimeout,
    #[error("data channel closed")]
    ChannelClosed,
    #[error("connection lost: {0}")]
    SessionFailed(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("cannot read source: {0}")]
    Source(String),
    #[error("cannot save: {0}")]
    Persist(String),
    #[error("node stopped")]
    NodeStopped,
}

/// Byte accounting of one logical item.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub peer: PeerId,
    pub kind: TransferKind,
    pub name: String,
    pub total_size: u64,
    pub mime_type: String,
    pub batch_index: Option<u32>,
    pub batch_total: Option<u32>,
    pub direction: Direction,
    bytes_transferred: u64,
}

impl Transfer {
    pub fn new(
        id: TransferId,
        peer: PeerId,
        kind: TransferKind,
        name: impl Into<String>,
        total_size: u64,
        mime_type: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            id,
            peer,
            kind,
            name: name.into(),
            total_size,
            mime_type: mime_type.into(),
            batch_index: None,
            batch_total: None,
            direction,
            bytes_transferred: 0,
        }
    }

    pub fn with_batch(mut self, index: Option<u32>, total: Option<u32>) -> Self {
        self.batch_index = index;
        self.batch_total = total;
        self
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Account `n` more bytes. Fails without mutating if the total would be
    /// exceeded.
    pub fn advance(&mut self, n: u64) -> Result<u64, TransferError> {
        let next = self.bytes_transferred + n;
        if next > self.total_size {
            return Err(TransferError::Protocol(format!(
                "{next} bytes exceed declared size {}",
                self.total_size
            )));
        }
        self.bytes_transferred = next;
        Ok(next)
    }

    /// Raise progress to `value` (clamped to the total). Never decreases.
    pub fn observe(&mut self, value: u64) -> u64 {
        let value = value.min(self.total_size);
        if value > self.bytes_transferred {
            self.bytes_transferred = value;
        }
        self.bytes_transferred
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred == self.total_size
    }
}

/// Rate limit for progress notifications.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(total: u64) -> Transfer {
        Transfer::new(
            1,
            PeerId::new("p"),
            TransferKind::File,
            "f",
            total,
            "application/octet-stream",
            Direction::Inbound,
        )
    }

    #[test]
    fn advance_bounded_by_total() {
        let mut t = transfer(10);
        assert_eq!(t.advance(4).unwrap(), 4);
        assert!(t.advance(7).is_err());
        assert_eq!(t.bytes_transferred(), 4);
        assert_eq!(t.advance(6).unwrap(), 10);
        assert!(t.is_complete());
    }

    #[test]
    fn observe_is_monotonic_and_clamped() {
        let mut t = transfer(100);
        assert_eq!(t.observe(40), 40);
        assert_eq!(t.observe(30), 40);
        assert_eq!(t.observe(500), 100);
    }

    #[test]
    fn ids_increase() {
        let ids = TransferIds::default();
        let a = ids.next();
        let b = ids.clone().next();
        assert!(b > a);
    }

    #[test]
    fn outcome_display() {
        assert_eq!(
            TransferOutcome::Delivered {
                acknowledged: false
            }
            .to_string(),
            "delivered (not acknowledged)"
        );
        assert_eq!(
            TransferOutcome::Failed {
                reason: TransferError::AckTimeout.to_string()
            }
            .to_string(),
            "failed: receiver did not accept the transfer in time"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_limits_rate() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(100));
        assert!(throttle.ready());
        assert!(!throttle.ready());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(throttle.ready());
    }
}
