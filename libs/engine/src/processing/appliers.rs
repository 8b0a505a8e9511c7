//! Event appliers, the only code that changes partition state

use crate::error::{EngineError, Result};
use crate::record::{DistributionIntent, Intent, Record, RecordValue, TenantIntent};
use crate::state::{KeyGenerator, MutableDistributionState, MutableTenantState};
use flowline_storage::Transaction;

/// Applies events to state, both while processing and during replay
pub struct EventAppliers {
    partition_id: u32,
    keys: KeyGenerator,
}

impl EventAppliers {
    pub fn new(partition_id: u32) -> Self {
        Self {
            partition_id,
            keys: KeyGenerator::new(partition_id),
        }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn apply(&self, txn: &mut Transaction, event: &Record) -> Result<()> {
        self.keys.observe(txn, event.key)?;

        match (event.intent, &event.value) {
            (Intent::Tenant(intent), RecordValue::Tenant(tenant)) => {
                let mut tenants = MutableTenantState::new(txn);
                match intent {
                    TenantIntent::Created => tenants.insert(tenant)?,
                    TenantIntent::Updated => tenants.update(tenant)?,
                    TenantIntent::Deleted => tenants.remove(tenant.tenant_key)?,
                    _ => return Err(no_applier(event)),
                }
            }
            (Intent::Distribution(intent), RecordValue::CommandDistribution(record)) => {
                let mut distributions = MutableDistributionState::new(txn);
                match intent {
                    DistributionIntent::Started => distributions.add(event.key, record)?,
                    DistributionIntent::Enqueued => {
                        let queue = record.queue.as_deref().ok_or_else(|| {
                            EngineError::Apply(format!(
                                "distribution {} enqueued without a queue",
                                event.key
                            ))
                        })?;
                        distributions.enqueue(queue, record.partition_id, event.key)?;
                    }
                    DistributionIntent::Distributing => {}
                    DistributionIntent::Acknowledged => {
                        distributions.acknowledge(event.key, record.partition_id)?
                    }
                    DistributionIntent::Finished => distributions.remove(event.key),
                    DistributionIntent::Acknowledge => return Err(no_applier(event)),
                }
            }
            _ => return Err(no_applier(event)),
        }
        Ok(())
    }
}

fn no_applier(event: &Record) -> EngineError {
    EngineError::Apply(format!(
        "no applier for {} with a {} value",
        event.intent,
        event.value_type().as_str()
    ))
}
