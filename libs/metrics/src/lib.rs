//! Per-partition metrics
//!
//! Every partition owns a [`PartitionMetrics`] with its own Prometheus
//! registry. Components receive the metric group they update explicitly;
//! nothing is registered globally, so several partitions (or several test
//! clusters) can live in one process.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Metrics registry for one partition
pub struct PartitionMetrics {
    /// Prometheus registry
    registry: Registry,
    /// Consensus metrics
    pub raft: RaftMetrics,
    /// Stream processor metrics
    pub processing: ProcessingMetrics,
    /// Snapshot metrics
    pub snapshot: SnapshotMetrics,
}

impl PartitionMetrics {
    /// Create a new metrics registry labelled with the partition id
    pub fn new(partition_id: u32) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let partition = partition_id.to_string();

        let raft = RaftMetrics::new(&registry, &partition)?;
        let processing = ProcessingMetrics::new(&registry, &partition)?;
        let snapshot = SnapshotMetrics::new(&registry, &partition)?;

        Ok(Self {
            registry,
            raft,
            processing,
            snapshot,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn opts(name: &str, help: &str, partition: &str) -> Opts {
    Opts::new(name, help).const_label("partition", partition)
}

fn histogram_opts(name: &str, help: &str, partition: &str) -> HistogramOpts {
    HistogramOpts::new(name, help).const_label("partition", partition)
}

/// Replication group metrics
#[derive(Clone)]
pub struct RaftMetrics {
    /// Role code: 0 bootstrapping, 1 follower, 2 candidate, 3 leader, 4 passive, 5 inactive
    pub role: IntGauge,
    pub term: IntGauge,
    pub commit_index: IntGauge,
    pub elections_total: IntCounter,
    /// Failed AppendEntries / InstallSnapshot requests per member
    pub replication_failures_total: IntCounterVec,
    pub pending_proposals: IntGauge,
    pub snapshots_sent_total: IntCounter,
}

impl RaftMetrics {
    fn new(registry: &Registry, partition: &str) -> prometheus::Result<Self> {
        let role = IntGauge::with_opts(opts("raft_role", "Current Raft role code", partition))?;
        registry.register(Box::new(role.clone()))?;

        let term = IntGauge::with_opts(opts("raft_term", "Current Raft term", partition))?;
        registry.register(Box::new(term.clone()))?;

        let commit_index = IntGauge::with_opts(opts(
            "raft_commit_index",
            "Highest committed log index",
            partition,
        ))?;
        registry.register(Box::new(commit_index.clone()))?;

        let elections_total = IntCounter::with_opts(opts(
            "raft_elections_total",
            "Elections started by this node",
            partition,
        ))?;
        registry.register(Box::new(elections_total.clone()))?;

        let replication_failures_total = IntCounterVec::new(
            opts(
                "raft_replication_failures_total",
                "Failed replication requests per member",
                partition,
            ),
            &["member"],
        )?;
        registry.register(Box::new(replication_failures_total.clone()))?;

        let pending_proposals = IntGauge::with_opts(opts(
            "raft_pending_proposals",
            "Proposals appended but not yet committed",
            partition,
        ))?;
        registry.register(Box::new(pending_proposals.clone()))?;

        let snapshots_sent_total = IntCounter::with_opts(opts(
            "raft_snapshots_sent_total",
            "Snapshots fully transferred to followers",
            partition,
        ))?;
        registry.register(Box::new(snapshots_sent_total.clone()))?;

        Ok(Self {
            role,
            term,
            commit_index,
            elections_total,
            replication_failures_total,
            pending_proposals,
            snapshots_sent_total,
        })
    }

    /// Metrics backed by a private registry, for nodes started without one
    pub fn standalone() -> prometheus::Result<Self> {
        Self::new(&Registry::new(), "standalone")
    }
}

/// Stream processor metrics
#[derive(Clone)]
pub struct ProcessingMetrics {
    pub commands_processed_total: IntCounterVec,
    pub events_replayed_total: IntCounter,
    pub rejections_total: IntCounterVec,
    pub last_processed_position: IntGauge,
    pub processing_latency: Histogram,
}

impl ProcessingMetrics {
    fn new(registry: &Registry, partition: &str) -> prometheus::Result<Self> {
        let commands_processed_total = IntCounterVec::new(
            opts(
                "stream_processor_commands_total",
                "Commands processed by value type",
                partition,
            ),
            &["value_type"],
        )?;
        registry.register(Box::new(commands_processed_total.clone()))?;

        let events_replayed_total = IntCounter::with_opts(opts(
            "stream_processor_events_replayed_total",
            "Events applied during replay",
            partition,
        ))?;
        registry.register(Box::new(events_replayed_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            opts(
                "stream_processor_rejections_total",
                "Command rejections by kind",
                partition,
            ),
            &["kind"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let last_processed_position = IntGauge::with_opts(opts(
            "stream_processor_last_processed_position",
            "Position of the last processed command",
            partition,
        ))?;
        registry.register(Box::new(last_processed_position.clone()))?;

        let processing_latency = Histogram::with_opts(histogram_opts(
            "stream_processor_processing_latency_seconds",
            "Time from reading a command to committing its results",
            partition,
        ))?;
        registry.register(Box::new(processing_latency.clone()))?;

        Ok(Self {
            commands_processed_total,
            events_replayed_total,
            rejections_total,
            last_processed_position,
            processing_latency,
        })
    }
}

/// Snapshot metrics
#[derive(Clone)]
pub struct SnapshotMetrics {
    pub snapshots_taken_total: IntCounter,
    pub snapshots_installed_total: IntCounter,
    pub snapshot_duration: Histogram,
    pub snapshot_size_bytes: IntGauge,
}

impl SnapshotMetrics {
    fn new(registry: &Registry, partition: &str) -> prometheus::Result<Self> {
        let snapshots_taken_total = IntCounter::with_opts(opts(
            "snapshots_taken_total",
            "Snapshots persisted locally",
            partition,
        ))?;
        registry.register(Box::new(snapshots_taken_total.clone()))?;

        let snapshots_installed_total = IntCounter::with_opts(opts(
            "snapshots_installed_total",
            "Snapshots received from a leader",
            partition,
        ))?;
        registry.register(Box::new(snapshots_installed_total.clone()))?;

        let snapshot_duration = Histogram::with_opts(histogram_opts(
            "snapshot_duration_seconds",
            "Time to checkpoint and persist a snapshot",
            partition,
        ))?;
        registry.register(Box::new(snapshot_duration.clone()))?;

        let snapshot_size_bytes = IntGauge::with_opts(opts(
            "snapshot_size_bytes",
            "Size of the latest snapshot",
            partition,
        ))?;
        registry.register(Box::new(snapshot_size_bytes.clone()))?;

        Ok(Self {
            snapshots_taken_total,
            snapshots_installed_total,
            snapshot_duration,
            snapshot_size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_have_independent_registries() {
        let first = PartitionMetrics::new(1).unwrap();
        let second = PartitionMetrics::new(2).unwrap();

        first.raft.elections_total.inc();
        first.processing.rejections_total.with_label_values(&["ALREADY_EXISTS"]).inc();

        assert_eq!(first.raft.elections_total.get(), 1);
        assert_eq!(second.raft.elections_total.get(), 0);

        let rendered = first.render().unwrap();
        assert!(rendered.contains("raft_elections_total{partition=\"1\"} 1"));
        assert!(rendered.contains("ALREADY_EXISTS"));
    }
}
