//! Distribution of commands to other partitions
//!
//! A distribution moves through `STARTED`, then per target partition
//! `ENQUEUED` (when it uses a queue) and `DISTRIBUTING`, until every target
//! sent an `ACKNOWLEDGE` and it is `FINISHED`. Sends are at-least-once:
//! targets must handle a command twice, and a leader re-sends whatever is
//! still pending on every redistribution tick.

use crate::error::ProcessingError;
use crate::processing::{CommandProcessor, ProcessingContext};
use crate::record::{
    CommandDistributionRecord, DistributionIntent, DistributionMetadata, Intent, LoggedRecord,
    Record, RecordValue, RejectionKind,
};
use crate::state::DistributionState;
use dashmap::DashMap;
use flowline_consensus::NodeId;
use flowline_storage::ReadContext;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Queue keeping identity changes (tenants) in order per partition
pub const IDENTITY_QUEUE: &str = "identity";

/// Writes distribution records on the origin partition
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandDistributionBehavior;

impl CommandDistributionBehavior {
    /// Distribute a command to every other partition
    ///
    /// With a queue, a target receives the command only after it acknowledged
    /// all earlier commands of the same queue.
    pub fn distribute(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command_key: u64,
        intent: Intent,
        value: RecordValue,
        queue: Option<&str>,
    ) -> Result<(), ProcessingError> {
        let own = ctx.partition_id();
        let targets: Vec<u32> = (1..=ctx.partition_count()).filter(|p| *p != own).collect();
        if targets.is_empty() {
            return Ok(());
        }

        let distribution_key = ctx.next_key()?;
        let record = CommandDistributionRecord {
            partition_id: own,
            queue: queue.map(str::to_string),
            command_key,
            value_type: value.value_type(),
            intent,
            command_value: Some(Box::new(value)),
            partitions: targets.clone(),
        };
        ctx.append_event(
            distribution_key,
            Intent::Distribution(DistributionIntent::Started),
            RecordValue::CommandDistribution(record.clone()),
        )?;

        for partition in targets {
            if queue.is_some() {
                ctx.append_event(
                    distribution_key,
                    Intent::Distribution(DistributionIntent::Enqueued),
                    RecordValue::CommandDistribution(record.for_partition(partition)),
                )?;
                if !ctx.distributions().can_send(distribution_key, partition)? {
                    continue;
                }
            }
            self.start_sending(ctx, distribution_key, &record, partition)?;
        }
        Ok(())
    }

    fn start_sending(
        &self,
        ctx: &mut ProcessingContext<'_>,
        distribution_key: u64,
        record: &CommandDistributionRecord,
        partition: u32,
    ) -> Result<(), ProcessingError> {
        ctx.append_event(
            distribution_key,
            Intent::Distribution(DistributionIntent::Distributing),
            RecordValue::CommandDistribution(record.for_partition(partition)),
        )?;
        let command = distributed_command(ctx.partition_id(), distribution_key, record)
            .ok_or_else(|| {
                ProcessingError::Unexpected(format!(
                    "distribution {} carries no command",
                    distribution_key
                ))
            })?;
        ctx.send(partition, command);
        Ok(())
    }

    /// Commands to re-send for every distribution still pending
    ///
    /// Queued distributions are only re-sent while at the head of their queue.
    pub fn pending_sends<C: ReadContext>(
        &self,
        partition_id: u32,
        state: &DistributionState<'_, C>,
    ) -> flowline_storage::Result<Vec<(u32, Record)>> {
        let mut sends = Vec::new();
        for pending in state.pending() {
            let (distribution_key, partition) = pending?;
            if !state.can_send(distribution_key, partition)? {
                continue;
            }
            let Some(record) = state.get(distribution_key)? else {
                continue;
            };
            if let Some(command) = distributed_command(partition_id, distribution_key, &record) {
                sends.push((partition, command));
            }
        }
        Ok(sends)
    }

    /// The acknowledgement a target sends once it processed a distributed command
    pub fn acknowledgement(&self, partition_id: u32, command: &Record) -> Option<(u32, Record)> {
        let metadata = command.distribution?;
        let ack = CommandDistributionRecord {
            partition_id,
            queue: None,
            command_key: command.key,
            value_type: command.value_type(),
            intent: command.intent,
            command_value: None,
            partitions: Vec::new(),
        };
        Some((
            metadata.origin_partition,
            Record::command(
                Intent::Distribution(DistributionIntent::Acknowledge),
                metadata.distribution_key,
                RecordValue::CommandDistribution(ack),
            ),
        ))
    }
}

fn distributed_command(
    origin_partition: u32,
    distribution_key: u64,
    record: &CommandDistributionRecord,
) -> Option<Record> {
    let value = record.command_value.as_deref()?.clone();
    let mut command = Record::command(record.intent, record.command_key, value);
    command.distribution = Some(DistributionMetadata {
        origin_partition,
        distribution_key,
    });
    Some(command)
}

/// Handles `COMMAND_DISTRIBUTION ACKNOWLEDGE` on the origin partition
pub struct AcknowledgeProcessor {
    distribution: CommandDistributionBehavior,
}

impl AcknowledgeProcessor {
    pub fn new() -> Self {
        Self {
            distribution: CommandDistributionBehavior,
        }
    }
}

impl Default for AcknowledgeProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandProcessor for AcknowledgeProcessor {
    fn process(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &LoggedRecord,
    ) -> Result<(), ProcessingError> {
        let (
            Intent::Distribution(DistributionIntent::Acknowledge),
            RecordValue::CommandDistribution(ack),
        ) = (command.record.intent, &command.record.value)
        else {
            return Err(ProcessingError::rejected(
                RejectionKind::InvalidArgument,
                format!("{} is not a distribution command", command.record.intent),
            ));
        };
        let distribution_key = command.record.key;
        let partition = ack.partition_id;

        let pending = ctx.distributions().is_pending(distribution_key, partition);
        let record = ctx.distributions().get(distribution_key)?;
        let Some(record) = record.filter(|_| pending) else {
            return Err(ProcessingError::rejected(
                RejectionKind::NotFound,
                format!(
                    "Expected to acknowledge distribution {} for partition {}, but it is not pending",
                    distribution_key, partition
                ),
            ));
        };

        ctx.append_event(
            distribution_key,
            Intent::Distribution(DistributionIntent::Acknowledged),
            RecordValue::CommandDistribution(record.for_partition(partition)),
        )?;

        if let Some(queue) = &record.queue {
            let next = ctx.distributions().queue_head(queue, partition)?;
            if let Some(next_key) = next {
                if let Some(next) = ctx.distributions().get(next_key)? {
                    self.distribution
                        .start_sending(ctx, next_key, &next, partition)?;
                }
            }
        }

        if !ctx.distributions().has_pending(distribution_key) {
            ctx.append_event(
                distribution_key,
                Intent::Distribution(DistributionIntent::Finished),
                RecordValue::CommandDistribution(record.for_partition(ctx.partition_id())),
            )?;
        }
        Ok(())
    }
}

/// Delivers commands to other partitions
///
/// Delivery is best effort; anything lost is re-sent by the origin.
pub trait InterPartitionSender: Send + Sync {
    fn send(&self, partition_id: u32, command: Record);
}

/// In-process router with one FIFO inbox per partition replica
///
/// A command is delivered to every replica of the target partition; only the
/// current leader writes it, so deliveries follow leadership changes without
/// the router tracking them. Partitions can be made unreachable to simulate
/// network failures; commands sent to them meanwhile are dropped.
#[derive(Clone, Default)]
pub struct PartitionRouter {
    inboxes: Arc<DashMap<u32, BTreeMap<NodeId, async_channel::Sender<Record>>>>,
    unreachable: Arc<RwLock<HashSet<u32>>>,
}

impl PartitionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the inbox of a partition replica, replacing an earlier one
    pub fn register(&self, partition_id: u32, node_id: NodeId) -> async_channel::Receiver<Record> {
        let (tx, rx) = async_channel::unbounded();
        let mut replicas = self.inboxes.entry(partition_id).or_default();
        if let Some(previous) = replicas.insert(node_id, tx) {
            previous.close();
        }
        rx
    }

    pub fn unregister(&self, partition_id: u32, node_id: NodeId) {
        if let Some(mut replicas) = self.inboxes.get_mut(&partition_id) {
            if let Some(inbox) = replicas.remove(&node_id) {
                inbox.close();
            }
        }
        self.inboxes.remove_if(&partition_id, |_, replicas| replicas.is_empty());
    }

    pub fn set_reachable(&self, partition_id: u32, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(&partition_id);
        } else {
            unreachable.insert(partition_id);
        }
    }
}

impl InterPartitionSender for PartitionRouter {
    fn send(&self, partition_id: u32, command: Record) {
        if self.unreachable.read().contains(&partition_id) {
            debug!("Dropping {} for unreachable partition {}", command.intent, partition_id);
            return;
        }
        let Some(replicas) = self.inboxes.get(&partition_id) else {
            debug!("Dropping {} for unknown partition {}", command.intent, partition_id);
            return;
        };
        for (node_id, inbox) in replicas.iter() {
            if inbox.try_send(command.clone()).is_err() {
                trace!("Inbox of partition {} on {} is closed", partition_id, node_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{EventAppliers, RecordProcessors, SideEffect};
    use crate::record::{RecordType, TenantIntent, TenantRecord};
    use flowline_storage::StateDb;

    fn logged(position: u64, record: Record) -> LoggedRecord {
        LoggedRecord {
            position,
            term: 1,
            index: position,
            record,
        }
    }

    /// Process a command on partition 1 of 3 and commit its results
    fn process(db: &StateDb, command: &LoggedRecord) -> (Vec<Record>, Vec<SideEffect>) {
        let appliers = EventAppliers::new(1);
        let mut txn = db.transaction();
        let mut ctx = ProcessingContext::new(&mut txn, &appliers, 3, command.position);
        let result = RecordProcessors::standard().process(&mut ctx, command);
        if let Err(ProcessingError::Rejected { kind, reason }) = result {
            ctx.rollback();
            ctx.append_rejection(command, kind, reason);
        }
        let parts = ctx.into_parts();
        txn.commit();
        parts
    }

    fn intents(records: &[Record]) -> Vec<Intent> {
        records.iter().map(|r| r.intent).collect()
    }

    fn sent(effects: &[SideEffect]) -> Vec<(u32, Record)> {
        effects
            .iter()
            .map(|SideEffect::Send { partition_id, command }| (*partition_id, command.clone()))
            .collect()
    }

    fn distribution(intent: DistributionIntent) -> Intent {
        Intent::Distribution(intent)
    }

    fn tenant_command(id: &str) -> Record {
        Record::command(
            Intent::Tenant(TenantIntent::Create),
            1,
            RecordValue::Tenant(TenantRecord {
                tenant_key: 1,
                tenant_id: id.to_string(),
                name: id.to_string(),
            }),
        )
    }

    fn tenant_id(record: Record) -> String {
        let RecordValue::Tenant(tenant) = record.value else {
            panic!("expected a tenant");
        };
        tenant.tenant_id
    }

    #[tokio::test]
    async fn test_router_keeps_order_and_drops_when_unreachable() {
        let router = PartitionRouter::new();
        let inbox = router.register(2, NodeId(1));

        router.set_reachable(2, false);
        router.send(2, tenant_command("lost"));
        router.set_reachable(2, true);
        router.send(2, tenant_command("first"));
        router.send(2, tenant_command("second"));

        for expected in ["first", "second"] {
            assert_eq!(tenant_id(inbox.recv().await.unwrap()), expected);
        }
        assert!(inbox.is_empty());
    }

    #[tokio::test]
    async fn test_router_delivers_to_every_replica() {
        let router = PartitionRouter::new();
        let replicas: Vec<_> = (1..=3).map(|id| router.register(2, NodeId(id))).collect();
        let other = router.register(3, NodeId(1));

        router.send(2, tenant_command("acme"));
        for inbox in &replicas {
            assert_eq!(tenant_id(inbox.recv().await.unwrap()), "acme");
        }
        assert!(other.is_empty());

        // A replica leaving does not affect the others
        router.unregister(2, NodeId(3));
        assert!(replicas[2].is_closed());
        router.send(2, tenant_command("globex"));
        for inbox in &replicas[..2] {
            assert_eq!(tenant_id(inbox.recv().await.unwrap()), "globex");
        }

        // Registering again replaces only that replica's inbox
        let replaced = router.register(2, NodeId(1));
        assert!(replicas[0].is_closed());
        assert!(!replicas[1].is_closed());
        router.send(2, tenant_command("initech"));
        assert_eq!(tenant_id(replaced.recv().await.unwrap()), "initech");
        assert_eq!(tenant_id(replicas[1].recv().await.unwrap()), "initech");
    }

    #[test]
    fn test_acknowledgement_targets_origin() {
        let behavior = CommandDistributionBehavior;
        assert!(behavior.acknowledgement(2, &tenant_command("a")).is_none());

        let mut command = tenant_command("a");
        command.distribution = Some(DistributionMetadata {
            origin_partition: 1,
            distribution_key: 77,
        });
        let (target, ack) = behavior.acknowledgement(2, &command).unwrap();
        assert_eq!(target, 1);
        assert_eq!(ack.key, 77);
        assert_eq!(ack.intent, Intent::Distribution(DistributionIntent::Acknowledge));
    }

    #[test]
    fn test_queued_distribution_waits_for_acknowledgements() {
        let db = StateDb::new();
        let behavior = CommandDistributionBehavior;

        let (records, effects) = process(&db, &logged(1, tenant_command("acme")));
        assert_eq!(
            intents(&records),
            vec![
                Intent::Tenant(TenantIntent::Created),
                distribution(DistributionIntent::Started),
                distribution(DistributionIntent::Enqueued),
                distribution(DistributionIntent::Distributing),
                distribution(DistributionIntent::Enqueued),
                distribution(DistributionIntent::Distributing),
            ]
        );
        let tenant_key = records[0].key;
        let create_key = records[1].key;
        let creates = sent(&effects);
        assert_eq!(creates.iter().map(|(p, _)| *p).collect::<Vec<_>>(), vec![2, 3]);
        assert!(creates.iter().all(|(_, c)| c.key == tenant_key));

        let mut update = tenant_command("acme");
        update.intent = Intent::Tenant(TenantIntent::Update);
        let (records, effects) = process(&db, &logged(2, update));
        let update_key = records[1].key;
        assert_eq!(
            intents(&records),
            vec![
                Intent::Tenant(TenantIntent::Updated),
                distribution(DistributionIntent::Started),
                distribution(DistributionIntent::Enqueued),
                distribution(DistributionIntent::Enqueued),
            ]
        );
        assert!(effects.is_empty());

        // Only queue heads are re-sent
        let resend = behavior
            .pending_sends(1, &DistributionState::new(&db))
            .unwrap();
        assert_eq!(resend.len(), 2);
        assert!(resend.iter().all(|(_, c)| c.distribution.unwrap().distribution_key == create_key));

        let (_, ack) = behavior.acknowledgement(2, &creates[0].1).unwrap();
        let (records, effects) = process(&db, &logged(3, ack.clone()));
        assert_eq!(
            intents(&records),
            vec![
                distribution(DistributionIntent::Acknowledged),
                distribution(DistributionIntent::Distributing),
            ]
        );
        assert_eq!(records[1].key, update_key);
        let updates = sent(&effects);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, 2);
        assert_eq!(updates[0].1.intent, Intent::Tenant(TenantIntent::Update));

        let (records, _) = process(&db, &logged(4, ack));
        assert_eq!(records[0].record_type, RecordType::CommandRejection);
        assert_eq!(
            records[0].rejection.as_ref().map(|r| r.kind),
            Some(RejectionKind::NotFound)
        );

        let (_, ack) = behavior.acknowledgement(3, &creates[1].1).unwrap();
        let (records, _) = process(&db, &logged(5, ack));
        assert_eq!(
            intents(&records),
            vec![
                distribution(DistributionIntent::Acknowledged),
                distribution(DistributionIntent::Distributing),
                distribution(DistributionIntent::Finished),
            ]
        );
        let state = DistributionState::new(&db);
        assert!(state.get(create_key).unwrap().is_none());
        assert!(state.has_pending(update_key));
    }
}
