use super::appliers::EventAppliers;
use crate::error::ProcessingError;
use crate::record::{
    Intent, LoggedRecord, Position, Record, RecordType, RecordValue, Rejection, RejectionKind,
};
use crate::state::{DistributionState, KeyGenerator, TenantState};
use flowline_storage::Transaction;

/// Work to do once the results of a command are committed
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Ship a command to another partition
    Send { partition_id: u32, command: Record },
}

/// Everything a command handler may touch
///
/// Events are applied to the transaction as soon as they are appended, so
/// later reads in the same handler observe them.
pub struct ProcessingContext<'a> {
    txn: &'a mut Transaction,
    appliers: &'a EventAppliers,
    keys: KeyGenerator,
    partition_id: u32,
    partition_count: u32,
    source_position: Position,
    records: Vec<Record>,
    side_effects: Vec<SideEffect>,
}

impl<'a> ProcessingContext<'a> {
    pub fn new(
        txn: &'a mut Transaction,
        appliers: &'a EventAppliers,
        partition_count: u32,
        source_position: Position,
    ) -> Self {
        let partition_id = appliers.partition_id();
        Self {
            txn,
            appliers,
            keys: KeyGenerator::new(partition_id),
            partition_id,
            partition_count,
            source_position,
            records: Vec::new(),
            side_effects: Vec::new(),
        }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn tenants(&self) -> TenantState<'_, Transaction> {
        TenantState::new(&*self.txn)
    }

    pub fn distributions(&self) -> DistributionState<'_, Transaction> {
        DistributionState::new(&*self.txn)
    }

    pub fn next_key(&mut self) -> Result<u64, ProcessingError> {
        Ok(self.keys.next_key(self.txn)?)
    }

    /// Append an event and apply it to the state
    pub fn append_event(
        &mut self,
        key: u64,
        intent: Intent,
        value: RecordValue,
    ) -> Result<(), ProcessingError> {
        let record = self.follow_up(RecordType::Event, key, intent, value);
        self.appliers.apply(self.txn, &record)?;
        self.records.push(record);
        Ok(())
    }

    /// Append a command to be processed after this one
    pub fn append_command(&mut self, key: u64, intent: Intent, value: RecordValue) {
        let record = self.follow_up(RecordType::Command, key, intent, value);
        self.records.push(record);
    }

    pub fn append_rejection(
        &mut self,
        command: &LoggedRecord,
        kind: RejectionKind,
        reason: String,
    ) {
        let command = &command.record;
        self.records.push(Record {
            record_type: RecordType::CommandRejection,
            intent: command.intent,
            key: command.key,
            value: command.value.clone(),
            rejection: Some(Rejection { kind, reason }),
            request: command.request,
            distribution: command.distribution,
            source_position: Some(self.source_position),
        });
    }

    pub fn send(&mut self, partition_id: u32, command: Record) {
        self.side_effects.push(SideEffect::Send {
            partition_id,
            command,
        });
    }

    /// Undo everything the handler did so far
    pub(crate) fn rollback(&mut self) {
        self.txn.rollback();
        self.records.clear();
        self.side_effects.clear();
    }

    pub(crate) fn into_parts(self) -> (Vec<Record>, Vec<SideEffect>) {
        (self.records, self.side_effects)
    }

    fn follow_up(
        &self,
        record_type: RecordType,
        key: u64,
        intent: Intent,
        value: RecordValue,
    ) -> Record {
        Record {
            record_type,
            intent,
            key,
            value,
            rejection: None,
            request: None,
            distribution: None,
            source_position: Some(self.source_position),
        }
    }
}
