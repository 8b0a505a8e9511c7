use super::columns;
use crate::record::CommandDistributionRecord;
use flowline_storage::{ReadContext, Result, Transaction, TypedColumn};

const DISTRIBUTIONS: TypedColumn<u64, CommandDistributionRecord> =
    TypedColumn::new(columns::DISTRIBUTIONS);
/// (distribution key, partition) still waiting for an acknowledgement
const PENDING: TypedColumn<(u64, u32), ()> = TypedColumn::new(columns::PENDING_DISTRIBUTIONS);
/// (queue, partition, distribution key); keys grow, so the first entry per
/// (queue, partition) is the head
const QUEUED: TypedColumn<(String, u32, u64), ()> =
    TypedColumn::new(columns::QUEUED_DISTRIBUTIONS);

/// Distributions started by this partition
pub struct DistributionState<'a, C> {
    ctx: &'a C,
}

impl<'a, C: ReadContext> DistributionState<'a, C> {
    pub fn new(ctx: &'a C) -> Self {
        Self { ctx }
    }

    pub fn get(&self, distribution_key: u64) -> Result<Option<CommandDistributionRecord>> {
        DISTRIBUTIONS.get(self.ctx, &distribution_key)
    }

    pub fn is_pending(&self, distribution_key: u64, partition_id: u32) -> bool {
        PENDING.exists(self.ctx, &(distribution_key, partition_id))
    }

    pub fn has_pending(&self, distribution_key: u64) -> bool {
        PENDING
            .iter_prefix(self.ctx, &distribution_key)
            .next()
            .is_some()
    }

    /// Lazily iterate all unacknowledged (distribution key, partition) pairs
    pub fn pending(&self) -> impl Iterator<Item = Result<(u64, u32)>> + 'a {
        PENDING.iter(self.ctx).map(|entry| entry.map(|(key, ())| key))
    }

    /// The distribution at the head of a partition's queue
    pub fn queue_head(&self, queue: &str, partition_id: u32) -> Result<Option<u64>> {
        QUEUED
            .iter_prefix(self.ctx, &(queue.to_string(), partition_id))
            .next()
            .transpose()
            .map(|head| head.map(|((_, _, key), ())| key))
    }

    /// Whether a pending distribution may be sent to `partition_id` now
    pub fn can_send(&self, distribution_key: u64, partition_id: u32) -> Result<bool> {
        let Some(record) = self.get(distribution_key)? else {
            return Ok(false);
        };
        match &record.queue {
            Some(queue) => Ok(self.queue_head(queue, partition_id)? == Some(distribution_key)),
            None => Ok(true),
        }
    }
}

/// Distribution writes, used by the event appliers only
pub(crate) struct MutableDistributionState<'a> {
    txn: &'a mut Transaction,
}

impl<'a> MutableDistributionState<'a> {
    pub fn new(txn: &'a mut Transaction) -> Self {
        Self { txn }
    }

    pub fn add(&mut self, distribution_key: u64, record: &CommandDistributionRecord) -> Result<()> {
        DISTRIBUTIONS.put(self.txn, &distribution_key, record)?;
        for partition in &record.partitions {
            PENDING.put(self.txn, &(distribution_key, *partition), &())?;
        }
        Ok(())
    }

    pub fn enqueue(&mut self, queue: &str, partition_id: u32, distribution_key: u64) -> Result<()> {
        QUEUED.put(
            self.txn,
            &(queue.to_string(), partition_id, distribution_key),
            &(),
        )
    }

    pub fn acknowledge(&mut self, distribution_key: u64, partition_id: u32) -> Result<()> {
        PENDING.delete(self.txn, &(distribution_key, partition_id));
        if let Some(record) = DISTRIBUTIONS.get(&*self.txn, &distribution_key)? {
            if let Some(queue) = record.queue {
                QUEUED.delete(self.txn, &(queue, partition_id, distribution_key));
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, distribution_key: u64) {
        DISTRIBUTIONS.delete(self.txn, &distribution_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Intent, TenantIntent, ValueType};
    use flowline_storage::StateDb;

    fn record(partitions: Vec<u32>) -> CommandDistributionRecord {
        CommandDistributionRecord {
            partition_id: 1,
            queue: Some("identity".to_string()),
            command_key: 7,
            value_type: ValueType::Tenant,
            intent: Intent::Tenant(TenantIntent::Create),
            command_value: None,
            partitions,
        }
    }

    #[test]
    fn test_queue_head_advances_on_acknowledge() {
        let db = StateDb::new();
        let mut txn = db.transaction();
        let mut state = MutableDistributionState::new(&mut txn);
        for key in [10, 11] {
            state.add(key, &record(vec![2, 3])).unwrap();
            state.enqueue("identity", 2, key).unwrap();
            state.enqueue("identity", 3, key).unwrap();
        }
        txn.commit();

        let view = DistributionState::new(&db);
        assert!(view.can_send(10, 2).unwrap());
        assert!(!view.can_send(11, 2).unwrap());

        let mut txn = db.transaction();
        MutableDistributionState::new(&mut txn).acknowledge(10, 2).unwrap();
        txn.commit();

        let view = DistributionState::new(&db);
        assert_eq!(view.queue_head("identity", 2).unwrap(), Some(11));
        assert_eq!(view.queue_head("identity", 3).unwrap(), Some(10));
        assert!(!view.is_pending(10, 2));
        assert!(view.has_pending(10));
        assert_eq!(view.pending().count(), 3);
    }
}
