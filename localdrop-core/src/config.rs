//! Node tuning: chunking, flow control, timeouts and presence intervals.

use std::time::Duration;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const DEFAULT_HIGH_WATER_MARK: usize = 1024 * 1024;
pub const DEFAULT_LOW_WATER_MARK: usize = 256 * 1024;
/// Inbound chunks are merged into blocks of this size.
pub const DEFAULT_CONSOLIDATE_THRESHOLD: usize = 4 * 1024 * 1024;
/// Longer texts are sent as a `message.txt` file item.
pub const DEFAULT_TEXT_INLINE_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub chunk_size: usize,
    pub high_water_mark: usize,
    pub low_water_mark: usize,
    pub consolidate_threshold: usize,
    pub text_inline_limit: usize,
    /// Max wait for the buffered amount to drain before sending anyway.
    pub backpressure_timeout: Duration,
    /// Max wait for a new channel to open.
    pub connect_timeout: Duration,
    /// Max wait for the receiver's `ack-transfer`.
    pub ack_timeout: Duration,
    /// Max wait for `transfer-complete` after the last chunk.
    pub completion_timeout: Duration,
    /// Pause between two queued items.
    pub queue_cooldown: Duration,
    pub progress_interval: Duration,
    pub heartbeat_interval: Duration,
    pub liveness_window: Duration,
    pub prune_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            consolidate_threshold: DEFAULT_CONSOLIDATE_THRESHOLD,
            text_inline_limit: DEFAULT_TEXT_INLINE_LIMIT,
            backpressure_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(120),
            completion_timeout: Duration::from_secs(10),
            queue_cooldown: Duration::from_millis(500),
            progress_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(5),
            liveness_window: Duration::from_secs(10),
            prune_interval: Duration::from_secs(5),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.low_water_mark >= self.high_water_mark {
            return Err(ConfigError::WaterMarks {
                low: self.low_water_mark,
                high: self.high_water_mark,
            });
        }
        if self.heartbeat_interval.is_zero()
            || self.heartbeat_interval * 2 > self.liveness_window
        {
            return Err(ConfigError::Heartbeat {
                heartbeat: self.heartbeat_interval,
                liveness: self.liveness_window,
            });
        }
        if self.prune_interval.is_zero() {
            return Err(ConfigError::ZeroPruneInterval);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size must be non-zero")]
    ZeroChunkSize,
    #[error("low-water mark ({low}) must be below high-water mark ({high})")]
    WaterMarks { low: usize, high: usize },
    #[error("heartbeat interval {heartbeat:?} must be non-zero and at most half the liveness window {liveness:?}")]
    Heartbeat {
        heartbeat: Duration,
        liveness: Duration,
    },
    #[error("prune interval must be non-zero")]
    ZeroPruneInterval,
}
