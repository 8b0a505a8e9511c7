//! Command handlers
//!
//! A [`CommandProcessor`] turns one command into follow-up records through a
//! [`ProcessingContext`]. Handlers are deterministic: they read state and the
//! command, take keys from the key generator, and never look at the clock,
//! randomness or I/O.

pub mod appliers;
mod context;
mod tenant;

pub use appliers::EventAppliers;
pub use context::{ProcessingContext, SideEffect};
pub use tenant::TenantProcessor;

use crate::distribution::AcknowledgeProcessor;
use crate::error::ProcessingError;
use crate::record::{LoggedRecord, RejectionKind, ValueType};
use std::collections::HashMap;

pub trait CommandProcessor: Send + Sync {
    fn process(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &LoggedRecord,
    ) -> Result<(), ProcessingError>;
}

/// Dispatches commands to the processor of their value type
pub struct RecordProcessors {
    processors: HashMap<ValueType, Box<dyn CommandProcessor>>,
}

impl RecordProcessors {
    pub fn empty() -> Self {
        Self {
            processors: HashMap::new(),
        }
    }

    /// Processors for every value type the engine knows
    pub fn standard() -> Self {
        let mut processors = Self::empty();
        processors.register(ValueType::Tenant, TenantProcessor::new());
        processors.register(ValueType::CommandDistribution, AcknowledgeProcessor::new());
        processors
    }

    pub fn register(&mut self, value_type: ValueType, processor: impl CommandProcessor + 'static) {
        self.processors.insert(value_type, Box::new(processor));
    }

    pub fn process(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &LoggedRecord,
    ) -> Result<(), ProcessingError> {
        let value_type = command.record.value_type();
        match self.processors.get(&value_type) {
            Some(processor) => processor.process(ctx, command),
            None => Err(ProcessingError::rejected(
                RejectionKind::InvalidArgument,
                format!("No processor for {} commands", value_type.as_str()),
            )),
        }
    }
}

impl Default for RecordProcessors {
    fn default() -> Self {
        Self::standard()
    }
}
