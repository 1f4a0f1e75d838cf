use crate::{RegistryStore, TenancyError, TenantAssignment, TenantId, TenantIdentifier};
use std::sync::Arc;
use tracing::{debug, info};

/// Read path from a tenant identifier to its assigned target. No caching at this layer.
#[derive(Clone)]
pub struct TenantRegistry {
    store: Arc<dyn RegistryStore>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    /// Resolve an id or code to the active tenant and its target.
    pub async fn lookup(
        &self,
        identifier: &TenantIdentifier,
    ) -> Result<TenantAssignment, TenancyError> {
        match self.store.find_active_tenant(identifier).await? {
            Some(assignment) => {
                debug!(
                    tenant_id = %assignment.tenant.id,
                    target_id = %assignment.target.id,
                    "Tenant lookup hit"
                );
                Ok(assignment)
            }
            None => {
                debug!(%identifier, "Tenant lookup miss");
                Err(TenancyError::TenantNotFound(identifier.clone()))
            }
        }
    }

    /// Mark a tenant inactive so lookups stop finding it.
    /// Handles already cached by a resolver stay live until invalidated.
    pub async fn deactivate(&self, tenant_id: TenantId) -> Result<(), TenancyError> {
        if !self.store.set_tenant_active(tenant_id, false).await? {
            return Err(TenancyError::TenantNotFound(tenant_id.into()));
        }
        info!(%tenant_id, "Tenant deactivated");
        Ok(())
    }
}
