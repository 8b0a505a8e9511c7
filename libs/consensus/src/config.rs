//! Raft configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and sizing of a replication group member
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Minimum election timeout
    ///
    /// Each timeout is drawn from `[min, max)`.
    #[serde(with = "millis")]
    pub election_timeout_min: Duration,

    /// Maximum election timeout
    #[serde(with = "millis")]
    pub election_timeout_max: Duration,

    /// How often a leader contacts idle followers; must stay below the
    /// election timeout
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    /// Entry limit of one append request
    pub max_append_entries: usize,

    /// Size limit of one append request; a single larger entry is still sent
    pub max_append_bytes: usize,

    /// Entries kept behind a snapshot so slightly lagging followers need no transfer
    pub snapshot_trailing_logs: u64,

    /// Size of a single InstallSnapshot chunk
    pub snapshot_chunk_size: usize,

    /// Followers lagging more entries than this behind an available
    /// snapshot receive the snapshot instead of the entries
    pub snapshot_replication_threshold: u64,

    /// Uncommitted proposals a leader accepts before rejecting new ones
    pub max_inflight_proposals: usize,

    /// Capacity of the node's request queue
    pub request_queue_capacity: usize,

    /// First retry delay after a failed replication request
    #[serde(with = "millis")]
    pub retry_backoff_base: Duration,

    /// Upper bound of the exponential retry delay
    #[serde(with = "millis")]
    pub retry_backoff_max: Duration,

    /// A leader that has not heard from a quorum for this long steps down
    #[serde(with = "millis")]
    pub quorum_response_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_append_entries: 100,
            max_append_bytes: 1024 * 1024,
            snapshot_trailing_logs: 1_000,
            snapshot_chunk_size: 512 * 1024,
            snapshot_replication_threshold: 10_000,
            max_inflight_proposals: 1_024,
            request_queue_capacity: 1_024,
            retry_backoff_base: Duration::from_millis(50),
            retry_backoff_max: Duration::from_secs(2),
            quorum_response_timeout: Duration::from_secs(1),
        }
    }
}

impl RaftConfig {
    /// Check the invariants between the settings
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err("election_timeout_min must be less than election_timeout_max".into());
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err("heartbeat_interval must be less than election_timeout_min".into());
        }
        if self.max_append_entries == 0 {
            return Err("max_append_entries must be greater than 0".into());
        }
        if self.snapshot_chunk_size == 0 {
            return Err("snapshot_chunk_size must be greater than 0".into());
        }
        if self.max_inflight_proposals == 0 || self.request_queue_capacity == 0 {
            return Err("proposal and request queue limits must be greater than 0".into());
        }
        if self.retry_backoff_base > self.retry_backoff_max {
            return Err("retry_backoff_base must not exceed retry_backoff_max".into());
        }
        if self.quorum_response_timeout <= self.heartbeat_interval {
            return Err("quorum_response_timeout must be greater than heartbeat_interval".into());
        }
        Ok(())
    }

    /// Exponential backoff with up to 25% jitter for the n-th failure
    pub fn retry_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let base = self
            .retry_backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.retry_backoff_max);
        let jitter_range = base.as_millis() as u64 / 4;
        let jitter = if jitter_range > 0 {
            rand::random::<u64>() % jitter_range
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    /// A random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(min + rand::random::<u64>() % (max - min).max(1))
    }
}

/// Builds a [`RaftConfig`], panicking on invalid settings
pub struct RaftConfigBuilder {
    config: RaftConfig,
}

impl RaftConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RaftConfig::default(),
        }
    }

    pub fn election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.config.election_timeout_min = min;
        self.config.election_timeout_max = max;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn max_append_entries(mut self, max: usize) -> Self {
        self.config.max_append_entries = max;
        self
    }

    pub fn max_append_bytes(mut self, max: usize) -> Self {
        self.config.max_append_bytes = max;
        self
    }

    pub fn snapshot_trailing_logs(mut self, trailing: u64) -> Self {
        self.config.snapshot_trailing_logs = trailing;
        self
    }

    pub fn snapshot_chunk_size(mut self, size: usize) -> Self {
        self.config.snapshot_chunk_size = size;
        self
    }

    pub fn snapshot_replication_threshold(mut self, threshold: u64) -> Self {
        self.config.snapshot_replication_threshold = threshold;
        self
    }

    pub fn max_inflight_proposals(mut self, max: usize) -> Self {
        self.config.max_inflight_proposals = max;
        self
    }

    pub fn request_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.request_queue_capacity = capacity;
        self
    }

    pub fn retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.retry_backoff_base = base;
        self.config.retry_backoff_max = max;
        self
    }

    pub fn quorum_response_timeout(mut self, timeout: Duration) -> Self {
        self.config.quorum_response_timeout = timeout;
        self
    }

    pub fn build(self) -> RaftConfig {
        if let Err(msg) = self.config.validate() {
            panic!("{}", msg);
        }
        self.config
    }
}

impl Default for RaftConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
