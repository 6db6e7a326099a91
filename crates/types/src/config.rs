use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default chunk size: 16 MiB.
///
/// Large enough to keep per-chunk overhead (request round trips, checksums)
/// low for multi-gigabyte objects, small enough that a retry re-sends a
/// bounded amount of data.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Tuning knobs for the transfer engine.
///
/// Credentials and destination endpoints are supplied by the caller; this
/// struct only covers engine behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Fixed chunk size in bytes. `0` means [`DEFAULT_CHUNK_SIZE`].
    pub chunk_size: usize,
    /// Maximum chunks in flight per session. The chunk stream is not pulled
    /// further once this many chunks are unresolved.
    pub max_in_flight: usize,
    /// Maximum attempts per chunk per destination, including the first.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub retry_base_delay: Duration,
    /// Cap on the backoff delay.
    pub retry_max_delay: Duration,
    /// Timeout for a single chunk put or range get.
    pub chunk_timeout: Duration,
    /// Compute and carry a SHA-256 digest per chunk.
    pub verify_checksums: bool,
    /// How long finished sessions stay visible to progress polling before
    /// the tracker drops them.
    pub progress_retention: Duration,
    /// Trailing window for transfer-rate calculation.
    pub rate_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_in_flight: 4,
            max_attempts: 5,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(60),
            verify_checksums: true,
            progress_retention: Duration::from_secs(300),
            rate_window: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Effective chunk size, resolving the `0` default.
    pub fn effective_chunk_size(&self) -> usize {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }

    /// Backoff delay before retry attempt `attempt` (1-based, where attempt 1
    /// is the first retry).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.retry_base_delay.saturating_mul(1u32 << exp);
        delay.min(self.retry_max_delay)
    }
}
