mod common;

use common::{fast_config, wait_until, TestPartition};
use flowline_engine::{CommandRequest, Intent, Partition, PartitionRouter, TenantIntent};

/// Partitions 1 and 2 of a two-partition setup, `replicas` nodes each
async fn start_partitions(
    router: &PartitionRouter,
    replicas: u64,
) -> anyhow::Result<(TestPartition, TestPartition)> {
    let config = |id| fast_config(id, 2);
    let first = TestPartition::start_with(1, replicas, config, Some(router.clone())).await?;
    let second = TestPartition::start_with(2, replicas, config, Some(router.clone())).await?;
    first.wait_for_leader().await;
    second.wait_for_leader().await;
    Ok((first, second))
}

/// Wait until the origin has no distribution left to finish
async fn wait_for_acknowledgements(origin: &Partition) -> bool {
    wait_until(|| {
        origin
            .state()
            .distributions()
            .pending()
            .next()
            .is_none()
            .then_some(())
    })
    .await
    .is_some()
}

#[tokio::test]
async fn test_tenant_is_distributed_to_other_partitions() -> anyhow::Result<()> {
    let router = PartitionRouter::new();
    let (first, second) = start_partitions(&router, 1).await?;
    let origin = first.replica(1);
    let target = second.replica(1);

    let created = origin
        .submit(CommandRequest::create_tenant("acme", "Acme"))
        .await?;
    assert_eq!(created.intent, Intent::Tenant(TenantIntent::Created));

    let distributed = wait_until(|| target.state().tenants().get_by_id("acme").ok().flatten())
        .await
        .expect("tenant not distributed");
    assert_eq!(distributed.tenant_key, created.key);
    assert_eq!(distributed.name, "Acme");

    assert!(wait_for_acknowledgements(origin).await, "distribution still pending on the origin");

    // The target does not distribute the command any further
    assert!(target.state().distributions().pending().next().is_none());

    first.shutdown().await;
    second.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_partition_receives_queued_commands_in_order() -> anyhow::Result<()> {
    let router = PartitionRouter::new();
    let (first, second) = start_partitions(&router, 1).await?;
    let origin = first.replica(1);
    let target = second.replica(1);
    router.set_reachable(2, false);

    let created = origin
        .submit(CommandRequest::create_tenant("acme", "Acme"))
        .await?;
    origin
        .submit(CommandRequest::update_tenant("acme", "Acme Renamed"))
        .await?;

    // Both wait for partition 2, the update behind the create
    let state = origin.state();
    let pending: Vec<_> = state
        .distributions()
        .pending()
        .collect::<Result<_, _>>()?;
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|(_, partition)| *partition == 2));
    assert!(target.state().tenants().get_by_id("acme")?.is_none());

    router.set_reachable(2, true);
    let renamed = wait_until(|| {
        target
            .state()
            .tenants()
            .get_by_id("acme")
            .ok()
            .flatten()
            .filter(|t| t.name == "Acme Renamed")
    })
    .await
    .expect("update not distributed");
    assert_eq!(renamed.tenant_key, created.key);

    assert!(wait_for_acknowledgements(origin).await, "distributions still pending on the origin");

    first.shutdown().await;
    second.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_deleted_tenant_is_removed_everywhere() -> anyhow::Result<()> {
    let router = PartitionRouter::new();
    let (first, second) = start_partitions(&router, 1).await?;
    let origin = first.replica(1);
    let target = second.replica(1);

    origin
        .submit(CommandRequest::create_tenant("acme", "Acme"))
        .await?;
    wait_until(|| target.state().tenants().get_by_id("acme").ok().flatten())
        .await
        .expect("tenant not distributed");

    origin.submit(CommandRequest::delete_tenant("acme")).await?;
    let removed = wait_until(|| (!target.state().tenants().exists("acme")).then_some(())).await;
    assert!(removed.is_some());

    first.shutdown().await;
    second.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_replicated_partitions_follow_the_target_leader() -> anyhow::Result<()> {
    let router = PartitionRouter::new();
    let (first, second) = start_partitions(&router, 3).await?;
    let origin = first.wait_for_leader().await;
    let target = second.wait_for_leader().await;

    let created = origin
        .submit(CommandRequest::create_tenant("acme", "Acme"))
        .await?;
    for replica in second.replicas.values() {
        let tenant = wait_until(|| replica.state().tenants().get_by_id("acme").ok().flatten())
            .await
            .expect("tenant not on every replica");
        assert_eq!(tenant.tenant_key, created.key);
    }
    assert!(wait_for_acknowledgements(origin).await);

    // Another replica takes over the target partition
    let old_id = target.node().id();
    second.network.isolate(old_id);
    let new_target = wait_until(|| {
        second
            .replicas
            .values()
            .find(|p| p.node().id() != old_id && p.status().is_ready_leader())
    })
    .await
    .expect("no new leader in the target partition");

    origin
        .submit(CommandRequest::update_tenant("acme", "Acme Renamed"))
        .await?;
    let renamed = wait_until(|| {
        new_target
            .state()
            .tenants()
            .get_by_id("acme")
            .ok()
            .flatten()
            .filter(|t| t.name == "Acme Renamed")
    })
    .await;
    assert!(renamed.is_some(), "update not delivered to the new leader");
    assert!(wait_for_acknowledgements(origin).await);

    second.network.heal(old_id);
    assert!(second.wait_for_convergence(new_target).await);

    first.shutdown().await;
    second.shutdown().await;
    Ok(())
}
