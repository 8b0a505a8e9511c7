mod common;

use common::{data_dir, fast_config, read_all, wait_until, TestPartition};
use flowline_engine::{CommandRequest, Replayer};
use flowline_storage::StateDb;
use std::time::Duration;

async fn submit_workload(partition: &flowline_engine::Partition) -> anyhow::Result<()> {
    for i in 0..8 {
        let id = format!("tenant-{}", i);
        partition
            .submit(CommandRequest::create_tenant(&id, "initial"))
            .await?;
        if i % 2 == 0 {
            partition
                .submit(CommandRequest::update_tenant(&id, "updated"))
                .await?;
        }
    }
    partition
        .submit(CommandRequest::delete_tenant("tenant-3"))
        .await?;
    partition
        .submit(CommandRequest::create_tenant("tenant-0", "duplicate"))
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_replaying_the_log_rebuilds_the_leader_state() -> anyhow::Result<()> {
    let cluster = TestPartition::start(1, 1).await?;
    let leader = cluster.wait_for_leader().await;
    submit_workload(leader).await?;

    let batches = read_all(leader.node())?;
    let mut replayer = Replayer::new(1, StateDb::new())?;
    let mut applied = 0;
    for batch in &batches {
        applied += replayer.replay_batch(batch)?;
    }
    assert!(applied > 0);
    assert_eq!(replayer.state().checksum()?, leader.state().checksum()?);
    assert_eq!(
        replayer.last_processed(),
        leader.state().last_processed_position()?
    );

    // Events of processed commands are skipped the second time
    let checksum = replayer.state().checksum()?;
    for batch in &batches {
        assert_eq!(replayer.replay_batch(batch)?, 0);
    }
    assert_eq!(replayer.state().checksum()?, checksum);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_snapshot_and_tail_equal_full_replay() -> anyhow::Result<()> {
    let cluster = TestPartition::start(1, 1).await?;
    let leader = cluster.wait_for_leader().await;
    submit_workload(leader).await?;
    let batches = read_all(leader.node())?;

    let mut full = Replayer::new(1, StateDb::new())?;
    for batch in &batches {
        full.replay_batch(batch)?;
    }

    for split in [1, batches.len() / 3, batches.len() / 2, batches.len() - 1] {
        let head_db = StateDb::new();
        let mut head = Replayer::new(1, head_db.clone())?;
        for batch in &batches[..split] {
            head.replay_batch(batch)?;
        }

        let restored = StateDb::new();
        restored.restore(&head_db.checkpoint()?)?;
        let mut tail = Replayer::new(1, restored)?;
        assert_eq!(tail.last_processed(), head.last_processed());
        for batch in &batches[split..] {
            tail.replay_batch(batch)?;
        }
        assert_eq!(
            tail.state().checksum()?,
            full.state().checksum()?,
            "split at batch {}",
            split
        );
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_restart_recovers_from_snapshot() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let config = |id| {
        let mut config = fast_config(id, 1);
        config.data_dir = Some(data_dir(&root, id));
        config.snapshot_period = Duration::from_millis(100);
        config.raft.snapshot_trailing_logs = 0;
        config
    };

    let cluster = TestPartition::start_with(1, 1, config, None).await?;
    let leader = cluster.wait_for_leader().await;
    submit_workload(leader).await?;
    let processed = leader.state().last_processed_position()?;
    let snapshot = wait_until(|| {
        leader
            .latest_snapshot()
            .filter(|s| s.processed_position == processed)
    })
    .await
    .expect("no snapshot taken");
    assert!(leader.metrics().snapshot.snapshots_taken_total.get() >= 1);
    let checksum = leader.state().checksum()?;
    cluster.shutdown().await;

    let cluster = TestPartition::start_with(1, 1, config, None).await?;
    let restarted = cluster.replica(1);
    let recovered = restarted.latest_snapshot().expect("recovered from snapshot");
    assert!(recovered.index >= snapshot.index);
    assert_eq!(restarted.state().checksum()?, checksum);
    assert_eq!(restarted.state().last_processed_position()?, processed);

    let leader = cluster.wait_for_leader().await;
    let duplicate = leader
        .submit(CommandRequest::create_tenant("tenant-1", "again"))
        .await?;
    assert!(duplicate.is_rejection());

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_lagging_follower_installs_snapshot() -> anyhow::Result<()> {
    let config = |id| {
        let mut config = fast_config(id, 1);
        config.snapshot_period = Duration::from_millis(100);
        config.raft.snapshot_trailing_logs = 0;
        config.raft.snapshot_replication_threshold = 1;
        config
    };
    let cluster = TestPartition::start_with(1, 3, config, None).await?;
    let leader = cluster.wait_for_leader().await;
    let lagging = cluster.followers_of(leader).remove(0);
    cluster.network.isolate(lagging.node().id());

    submit_workload(leader).await?;
    let processed = leader.state().last_processed_position()?;
    wait_until(|| {
        leader
            .latest_snapshot()
            .filter(|s| s.processed_position == processed)
    })
    .await
    .expect("no snapshot taken");

    cluster.network.heal(lagging.node().id());
    assert!(cluster.wait_for_convergence(leader).await);
    assert!(lagging.metrics().snapshot.snapshots_installed_total.get() >= 1);
    assert_eq!(lagging.state().last_processed_position()?, processed);

    cluster.shutdown().await;
    Ok(())
}
