//! Keyed state of a partition
//!
//! All state lives in column families of one [`StateDb`]. It is changed only
//! by event appliers, so it is a pure function of the committed log prefix.
//! Views are generic over [`ReadContext`]: handlers read through their open
//! transaction, queries read committed data.

mod distribution;
mod keys;
mod tenant;

pub use distribution::DistributionState;
pub use keys::{key_partition, KeyGenerator};
pub use tenant::TenantState;

pub(crate) use distribution::MutableDistributionState;
pub(crate) use tenant::MutableTenantState;

use crate::record::Position;
use flowline_storage::{ColumnId, ReadContext, Result, StateDb, Transaction, TypedColumn};

pub(crate) mod columns {
    use super::ColumnId;

    pub const KEY_GENERATOR: ColumnId = 1;
    pub const LAST_PROCESSED: ColumnId = 2;
    pub const TENANTS: ColumnId = 3;
    pub const TENANT_IDS: ColumnId = 4;
    pub const DISTRIBUTIONS: ColumnId = 5;
    pub const PENDING_DISTRIBUTIONS: ColumnId = 6;
    pub const QUEUED_DISTRIBUTIONS: ColumnId = 7;
}

const LAST_PROCESSED: TypedColumn<u32, Position> = TypedColumn::new(columns::LAST_PROCESSED);
const LAST_PROCESSED_KEY: u32 = 0;

/// Read-only handle on a partition's state
///
/// Clones share the same data. Reads observe committed processing results
/// only.
#[derive(Clone)]
pub struct ProcessingState {
    db: StateDb,
}

impl ProcessingState {
    pub fn new(db: StateDb) -> Self {
        Self { db }
    }

    pub fn tenants(&self) -> TenantState<'_, StateDb> {
        TenantState::new(&self.db)
    }

    pub fn distributions(&self) -> DistributionState<'_, StateDb> {
        DistributionState::new(&self.db)
    }

    /// Position of the last command whose results are in the state
    pub fn last_processed_position(&self) -> Result<Position> {
        last_processed_position(&self.db)
    }

    /// Content hash, equal on replicas that applied the same log prefix
    pub fn checksum(&self) -> Result<String> {
        self.db.checksum()
    }
}

pub(crate) fn last_processed_position<C: ReadContext>(ctx: &C) -> Result<Position> {
    Ok(LAST_PROCESSED
        .get(ctx, &LAST_PROCESSED_KEY)?
        .unwrap_or_default())
}

pub(crate) fn mark_processed(txn: &mut Transaction, position: Position) -> Result<()> {
    LAST_PROCESSED.put(txn, &LAST_PROCESSED_KEY, &position)
}
