use super::columns;
use crate::record::TenantRecord;
use flowline_storage::{ReadContext, Result, Transaction, TypedColumn};

const TENANTS: TypedColumn<u64, TenantRecord> = TypedColumn::new(columns::TENANTS);
const TENANT_IDS: TypedColumn<String, u64> = TypedColumn::new(columns::TENANT_IDS);

/// Tenants by key, with a secondary index on the tenant id
pub struct TenantState<'a, C> {
    ctx: &'a C,
}

impl<'a, C: ReadContext> TenantState<'a, C> {
    pub fn new(ctx: &'a C) -> Self {
        Self { ctx }
    }

    pub fn get(&self, key: u64) -> Result<Option<TenantRecord>> {
        TENANTS.get(self.ctx, &key)
    }

    pub fn get_by_id(&self, tenant_id: &str) -> Result<Option<TenantRecord>> {
        match TENANT_IDS.get(self.ctx, &tenant_id.to_string())? {
            Some(key) => self.get(key),
            None => Ok(None),
        }
    }

    pub fn exists(&self, tenant_id: &str) -> bool {
        TENANT_IDS.exists(self.ctx, &tenant_id.to_string())
    }

    /// Lazily iterate tenants in key order
    pub fn iter(&self) -> impl Iterator<Item = Result<TenantRecord>> + 'a {
        TENANTS.iter(self.ctx).map(|entry| entry.map(|(_, tenant)| tenant))
    }

    /// Up to `limit` tenants with a key greater than `after`
    pub fn list(&self, after: Option<u64>, limit: usize) -> Result<Vec<TenantRecord>> {
        self.iter()
            .filter(|tenant| match (tenant, after) {
                (Ok(tenant), Some(after)) => tenant.tenant_key > after,
                _ => true,
            })
            .take(limit)
            .collect()
    }
}

/// Tenant writes, used by the event appliers only
pub(crate) struct MutableTenantState<'a> {
    txn: &'a mut Transaction,
}

impl<'a> MutableTenantState<'a> {
    pub fn new(txn: &'a mut Transaction) -> Self {
        Self { txn }
    }

    pub fn insert(&mut self, tenant: &TenantRecord) -> Result<()> {
        TENANTS.put(self.txn, &tenant.tenant_key, tenant)?;
        TENANT_IDS.put(self.txn, &tenant.tenant_id, &tenant.tenant_key)
    }

    pub fn update(&mut self, tenant: &TenantRecord) -> Result<()> {
        if let Some(previous) = TENANTS.get(&*self.txn, &tenant.tenant_key)? {
            if previous.tenant_id != tenant.tenant_id {
                TENANT_IDS.delete(self.txn, &previous.tenant_id);
            }
        }
        self.insert(tenant)
    }

    pub fn remove(&mut self, tenant_key: u64) -> Result<()> {
        if let Some(previous) = TENANTS.get(&*self.txn, &tenant_key)? {
            TENANT_IDS.delete(self.txn, &previous.tenant_id);
        }
        TENANTS.delete(self.txn, &tenant_key);
        Ok(())
    }
}
