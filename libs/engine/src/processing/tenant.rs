use super::{CommandProcessor, ProcessingContext};
use crate::distribution::{CommandDistributionBehavior, IDENTITY_QUEUE};
use crate::error::ProcessingError;
use crate::record::{Intent, LoggedRecord, RecordValue, RejectionKind, TenantIntent, TenantRecord};

/// Creates, updates and deletes tenants on every partition
///
/// Commands submitted by a client are distributed to all other partitions on
/// the identity queue. Distributed commands reuse the origin's tenant key.
pub struct TenantProcessor {
    distribution: CommandDistributionBehavior,
}

impl TenantProcessor {
    pub fn new() -> Self {
        Self {
            distribution: CommandDistributionBehavior,
        }
    }

    fn create(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &LoggedRecord,
        tenant: &TenantRecord,
    ) -> Result<(), ProcessingError> {
        validate(tenant)?;
        if ctx.tenants().exists(&tenant.tenant_id) {
            return Err(ProcessingError::rejected(
                RejectionKind::AlreadyExists,
                format!(
                    "Expected to create tenant with id '{}', but a tenant with this id already exists",
                    tenant.tenant_id
                ),
            ));
        }

        let key = match command.record.distribution {
            Some(_) => command.record.key,
            None => ctx.next_key()?,
        };
        let created = TenantRecord {
            tenant_key: key,
            tenant_id: tenant.tenant_id.clone(),
            name: tenant.name.clone(),
        };
        self.commit(ctx, command, key, TenantIntent::Created, created)
    }

    fn update(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &LoggedRecord,
        tenant: &TenantRecord,
    ) -> Result<(), ProcessingError> {
        validate(tenant)?;
        let existing = find(ctx, &tenant.tenant_id, "update")?;
        let updated = TenantRecord {
            tenant_key: existing.tenant_key,
            tenant_id: existing.tenant_id,
            name: tenant.name.clone(),
        };
        self.commit(ctx, command, updated.tenant_key, TenantIntent::Updated, updated)
    }

    fn delete(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &LoggedRecord,
        tenant: &TenantRecord,
    ) -> Result<(), ProcessingError> {
        let existing = find(ctx, &tenant.tenant_id, "delete")?;
        self.commit(ctx, command, existing.tenant_key, TenantIntent::Deleted, existing)
    }

    fn commit(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &LoggedRecord,
        key: u64,
        intent: TenantIntent,
        tenant: TenantRecord,
    ) -> Result<(), ProcessingError> {
        ctx.append_event(key, Intent::Tenant(intent), RecordValue::Tenant(tenant.clone()))?;
        if command.record.distribution.is_none() {
            let requested = RecordValue::Tenant(tenant);
            self.distribution.distribute(
                ctx,
                key,
                command.record.intent,
                requested,
                Some(IDENTITY_QUEUE),
            )?;
        }
        Ok(())
    }
}

impl Default for TenantProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandProcessor for TenantProcessor {
    fn process(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &LoggedRecord,
    ) -> Result<(), ProcessingError> {
        let RecordValue::Tenant(tenant) = &command.record.value else {
            return Err(ProcessingError::rejected(
                RejectionKind::InvalidArgument,
                "Expected a tenant value",
            ));
        };
        match command.record.intent {
            Intent::Tenant(TenantIntent::Create) => self.create(ctx, command, tenant),
            Intent::Tenant(TenantIntent::Update) => self.update(ctx, command, tenant),
            Intent::Tenant(TenantIntent::Delete) => self.delete(ctx, command, tenant),
            intent => Err(ProcessingError::rejected(
                RejectionKind::InvalidArgument,
                format!("{} is not a tenant command", intent),
            )),
        }
    }
}

fn validate(tenant: &TenantRecord) -> Result<(), ProcessingError> {
    if tenant.tenant_id.trim().is_empty() {
        return Err(ProcessingError::rejected(
            RejectionKind::InvalidArgument,
            "Expected a non-empty tenant id",
        ));
    }
    if tenant.name.trim().is_empty() {
        return Err(ProcessingError::rejected(
            RejectionKind::InvalidArgument,
            format!("Expected a non-empty name for tenant '{}'", tenant.tenant_id),
        ));
    }
    Ok(())
}

fn find(
    ctx: &ProcessingContext<'_>,
    tenant_id: &str,
    action: &str,
) -> Result<TenantRecord, ProcessingError> {
    ctx.tenants().get_by_id(tenant_id)?.ok_or_else(|| {
        ProcessingError::rejected(
            RejectionKind::NotFound,
            format!(
                "Expected to {} tenant with id '{}', but no tenant with this id exists",
                action, tenant_id
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{EventAppliers, SideEffect};
    use crate::record::{DistributionIntent, DistributionMetadata, Record, RecordType};
    use flowline_storage::StateDb;

    fn command(intent: TenantIntent, key: u64, id: &str, name: &str) -> LoggedRecord {
        LoggedRecord {
            position: 10,
            term: 1,
            index: 5,
            record: Record::command(
                Intent::Tenant(intent),
                key,
                RecordValue::Tenant(TenantRecord {
                    tenant_key: key,
                    tenant_id: id.to_string(),
                    name: name.to_string(),
                }),
            ),
        }
    }

    fn process(
        db: &StateDb,
        partition_count: u32,
        command: &LoggedRecord,
    ) -> Result<(Vec<Record>, Vec<SideEffect>), ProcessingError> {
        let appliers = EventAppliers::new(2);
        let mut txn = db.transaction();
        let mut ctx =
            ProcessingContext::new(&mut txn, &appliers, partition_count, command.position);
        TenantProcessor::new().process(&mut ctx, command)?;
        let parts = ctx.into_parts();
        txn.commit();
        Ok(parts)
    }

    #[test]
    fn test_create_takes_a_key_of_this_partition() {
        let db = StateDb::new();
        let (records, effects) =
            process(&db, 2, &command(TenantIntent::Create, 0, "acme", "Acme")).unwrap();

        let intents: Vec<Intent> = records.iter().map(|r| r.intent).collect();
        assert_eq!(
            intents,
            vec![
                Intent::Tenant(TenantIntent::Created),
                Intent::Distribution(DistributionIntent::Started),
                Intent::Distribution(DistributionIntent::Enqueued),
                Intent::Distribution(DistributionIntent::Distributing),
            ]
        );
        let created = &records[0];
        assert_eq!(created.record_type, RecordType::Event);
        assert_eq!(created.source_position, Some(10));
        assert_eq!(crate::state::key_partition(created.key), 2);

        // The other partition gets the command under the same tenant key
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            SideEffect::Send {
                partition_id,
                command,
            } => {
                assert_eq!(*partition_id, 1);
                assert_eq!(command.key, created.key);
                assert_eq!(command.intent, Intent::Tenant(TenantIntent::Create));
            }
        }

        let err = process(&db, 2, &command(TenantIntent::Create, 0, "acme", "Other")).unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::Rejected {
                kind: RejectionKind::AlreadyExists,
                ..
            }
        ));
    }

    #[test]
    fn test_distributed_create_reuses_the_origin_key() {
        let db = StateDb::new();
        let mut distributed = command(TenantIntent::Create, 4242, "acme", "Acme");
        distributed.record.distribution = Some(DistributionMetadata {
            origin_partition: 1,
            distribution_key: 7,
        });

        let (records, effects) = process(&db, 3, &distributed).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, 4242);
        assert!(effects.is_empty());

        let stored = crate::state::TenantState::new(&db).get(4242).unwrap().unwrap();
        assert_eq!(stored.tenant_id, "acme");
    }

    #[test]
    fn test_invalid_and_missing_tenants_are_rejected() {
        let db = StateDb::new();
        for (cmd, expected) in [
            (command(TenantIntent::Create, 0, " ", "x"), RejectionKind::InvalidArgument),
            (command(TenantIntent::Create, 0, "acme", ""), RejectionKind::InvalidArgument),
            (command(TenantIntent::Update, 0, "acme", "x"), RejectionKind::NotFound),
            (command(TenantIntent::Delete, 0, "acme", ""), RejectionKind::NotFound),
        ] {
            match process(&db, 2, &cmd) {
                Err(ProcessingError::Rejected { kind, .. }) => assert_eq!(kind, expected),
                other => panic!("expected a rejection, got {:?}", other),
            }
        }
    }
}
