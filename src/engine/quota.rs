use std::sync::Arc;

use uuid::Uuid;

use super::error::{EngineError, EngineResult};
use super::lifecycle;
use crate::database::store::{ReserveOutcome, Store};
use crate::models::{ResourceClass, Tenant};

/// Per-tenant limit/usage counters.
///
/// Reservations are a single conditional increment in the store, so two
/// concurrent callers can never both take the last unit.
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn Store>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn tenant(&self, tenant_id: Uuid) -> EngineResult<Tenant> {
        self.store
            .get_tenant(tenant_id)
            .await?
            .ok_or(EngineError::not_found("Tenant"))
    }

    /// Advisory; the answer may be stale by the time the caller acts on it
    pub async fn can_reserve(&self, tenant_id: Uuid, resource: ResourceClass, amount: i64) -> EngineResult<bool> {
        let tenant = self.tenant(tenant_id).await?;
        Ok(lifecycle::can_reserve(&tenant, resource, amount))
    }

    /// Returns the usage after the increment
    pub async fn reserve(&self, tenant_id: Uuid, resource: ResourceClass, amount: i64) -> EngineResult<i64> {
        if amount < 0 {
            return Err(EngineError::validation("reservation amount must not be negative"));
        }

        match self.store.try_reserve(tenant_id, resource, amount).await? {
            Some(ReserveOutcome::Reserved { usage }) => {
                tracing::debug!("Reserved {} {} for tenant {} (usage {})", amount, resource, tenant_id, usage);
                Ok(usage)
            }
            Some(ReserveOutcome::Exceeded { limit, current }) => {
                tracing::warn!(
                    "Quota exceeded for tenant {}: {} limit {} current {} requested {}",
                    tenant_id, resource, limit, current, amount
                );
                Err(EngineError::QuotaExceeded { resource, limit, current })
            }
            Some(ReserveOutcome::Inactive(status)) => Err(EngineError::TenantInactive(status)),
            None => Err(EngineError::not_found("Tenant")),
        }
    }

    /// Saturates at zero; returns the usage after the decrement
    pub async fn release(&self, tenant_id: Uuid, resource: ResourceClass, amount: i64) -> EngineResult<i64> {
        if amount <= 0 {
            return Ok(self.tenant(tenant_id).await?.usage.get(resource));
        }
        let usage = self
            .store
            .release(tenant_id, resource, amount)
            .await?
            .ok_or(EngineError::not_found("Tenant"))?;
        tracing::debug!("Released {} {} for tenant {} (usage {})", amount, resource, tenant_id, usage);
        Ok(usage)
    }

    /// Release used on compensation paths: failures are logged, not returned
    pub async fn release_quietly(&self, tenant_id: Uuid, resource: ResourceClass, amount: i64) {
        if let Err(e) = self.release(tenant_id, resource, amount).await {
            tracing::error!(
                "Failed to release {} {} for tenant {}: {}",
                amount, resource, tenant_id, e
            );
        }
    }
}
