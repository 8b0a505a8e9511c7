//! Engine and partition configuration
//!
//! Durations are (de)serialized as milliseconds. A configuration file holds
//! an [`EngineConfig`]; the per-partition [`PartitionConfig`] is derived from
//! it for every partition the node hosts.

use crate::error::{EngineError, Result};
use flowline_consensus::{millis, Member, NodeId, RaftConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings shared by every partition of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub node_id: NodeId,

    /// Number of partitions in the cluster; partition ids are `1..=count`
    pub partition_count: u32,

    /// Root of the on-disk data; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,

    /// How often the processor takes a snapshot
    #[serde(with = "millis")]
    pub snapshot_period: Duration,

    /// How often a leader re-sends unacknowledged distributions
    #[serde(with = "millis")]
    pub redistribution_interval: Duration,

    /// How long `submit` waits for the command's response
    #[serde(with = "millis")]
    pub request_timeout: Duration,

    pub raft: RaftConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(1),
            partition_count: 1,
            data_dir: None,
            snapshot_period: Duration::from_secs(5 * 60),
            redistribution_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            raft: RaftConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(EngineError::Config(
                "partition_count must be greater than 0".into(),
            ));
        }
        if self.snapshot_period.is_zero() {
            return Err(EngineError::Config(
                "snapshot_period must be greater than 0".into(),
            ));
        }
        if self.redistribution_interval.is_zero() {
            return Err(EngineError::Config(
                "redistribution_interval must be greater than 0".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(EngineError::Config(
                "request_timeout must be greater than 0".into(),
            ));
        }
        self.raft.validate().map_err(EngineError::Config)
    }

    /// Configuration of one partition replica hosted by this node
    pub fn partition(&self, partition_id: u32, members: Vec<Member>) -> Result<PartitionConfig> {
        if partition_id == 0 || partition_id > self.partition_count {
            return Err(EngineError::Config(format!(
                "partition {} outside 1..={}",
                partition_id, self.partition_count
            )));
        }
        Ok(PartitionConfig {
            partition_id,
            members,
            engine: self.clone(),
        })
    }
}

/// Settings of one partition replica
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionConfig {
    pub partition_id: u32,
    /// Initial members of the partition's replication group
    pub members: Vec<Member>,
    pub engine: EngineConfig,
}

impl PartitionConfig {
    pub fn node_id(&self) -> NodeId {
        self.engine.node_id
    }

    pub fn partition_count(&self) -> u32 {
        self.engine.partition_count
    }

    /// Directory of this replica, if it persists anything
    pub fn partition_dir(&self) -> Option<PathBuf> {
        self.engine
            .data_dir
            .as_ref()
            .map(|dir| dir.join(format!("partition-{}", self.partition_id)))
    }
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.config.node_id = node_id;
        self
    }

    pub fn partition_count(mut self, count: u32) -> Self {
        self.config.partition_count = count;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    pub fn snapshot_period(mut self, period: Duration) -> Self {
        self.config.snapshot_period = period;
        self
    }

    pub fn redistribution_interval(mut self, interval: Duration) -> Self {
        self.config.redistribution_interval = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn raft(mut self, raft: RaftConfig) -> Self {
        self.config.raft = raft;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
