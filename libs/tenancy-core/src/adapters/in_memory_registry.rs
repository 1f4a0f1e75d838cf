use crate::{
    NewTarget, PhysicalDatabaseTarget, RegistryStore, TargetClaim, TargetId, TargetState,
    TenancyError, TenantAssignment, TenantId, TenantIdentifier, TenantRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet, mapref::entry::Entry};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

type Endpoint = (String, u16, String);

/// In-memory implementation of the RegistryStore port for testing and single-process mode.
/// Claims are tracked in a shared set, so concurrent allocators never hold the same target.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistryStore {
    targets: Arc<DashMap<TargetId, PhysicalDatabaseTarget>>,
    endpoints: Arc<DashMap<Endpoint, TargetId>>,
    tenants: Arc<DashMap<TenantId, TenantRecord>>,
    codes: Arc<DashMap<String, TenantId>>,
    claimed: Arc<DashSet<TargetId>>,
    last_target_id: Arc<AtomicI64>,
}

impl InMemoryRegistryStore {
    /// Number of targets currently held by an in-flight allocation.
    pub fn claimed_count(&self) -> usize {
        self.claimed.len()
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    /// Insert a target with an explicit id and state, bypassing the id sequence.
    /// Intended for tests that need a specific starting inventory.
    pub fn insert_target_with_state(
        &self,
        target: NewTarget,
        id: TargetId,
        state: TargetState,
    ) -> PhysicalDatabaseTarget {
        let stored = PhysicalDatabaseTarget {
            id,
            host: target.host,
            port: target.port,
            username: target.username,
            password: target.password,
            database: target.database,
            engine: target.engine,
            state,
            last_allocated_at: None,
        };
        self.last_target_id.fetch_max(id.0, Ordering::SeqCst);
        self.endpoints.insert(
            (stored.host.clone(), stored.port, stored.database.clone()),
            id,
        );
        self.targets.insert(id, stored.clone());
        stored
    }

    fn try_claim(&self, id: TargetId) -> Option<PhysicalDatabaseTarget> {
        if !self.claimed.insert(id) {
            return None;
        }
        // Another allocator may have committed this target between our scan and the claim.
        let target = self
            .targets
            .get(&id)
            .filter(|t| !t.is_allocated())
            .map(|t| t.value().clone());
        if target.is_none() {
            self.claimed.remove(&id);
        }
        target
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn claim_unallocated_target(&self) -> Result<Option<Box<dyn TargetClaim>>, TenancyError> {
        let mut candidates: Vec<TargetId> = self
            .targets
            .iter()
            .filter(|entry| !entry.value().is_allocated())
            .map(|entry| *entry.key())
            .collect();
        candidates.sort();

        for id in candidates {
            if let Some(target) = self.try_claim(id) {
                return Ok(Some(Box::new(InMemoryClaim {
                    store: self.clone(),
                    target,
                })));
            }
        }
        Ok(None)
    }

    async fn find_active_tenant(
        &self,
        identifier: &TenantIdentifier,
    ) -> Result<Option<TenantAssignment>, TenancyError> {
        let tenant_id = match identifier {
            TenantIdentifier::Id(id) => *id,
            TenantIdentifier::Code(code) => match self.codes.get(code) {
                Some(id) => *id.value(),
                None => return Ok(None),
            },
        };
        let tenant = match self.tenants.get(&tenant_id) {
            Some(record) if record.active => record.value().clone(),
            _ => return Ok(None),
        };
        let target = self
            .targets
            .get(&tenant.target_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| {
                TenancyError::Storage(format!(
                    "Tenant {} references missing target {}",
                    tenant.id, tenant.target_id
                ))
            })?;
        Ok(Some(TenantAssignment { tenant, target }))
    }

    async fn insert_target(
        &self,
        target: NewTarget,
    ) -> Result<Option<PhysicalDatabaseTarget>, TenancyError> {
        let endpoint = (target.host.clone(), target.port, target.database.clone());
        let id = match self.endpoints.entry(endpoint) {
            Entry::Occupied(_) => return Ok(None),
            Entry::Vacant(vacant) => {
                let id = TargetId(self.last_target_id.fetch_add(1, Ordering::SeqCst) + 1);
                vacant.insert(id);
                id
            }
        };
        let stored = PhysicalDatabaseTarget {
            id,
            host: target.host,
            port: target.port,
            username: target.username,
            password: target.password,
            database: target.database,
            engine: target.engine,
            state: TargetState::Unallocated,
            last_allocated_at: None,
        };
        self.targets.insert(id, stored.clone());
        Ok(Some(stored))
    }

    async fn list_targets(&self) -> Result<Vec<PhysicalDatabaseTarget>, TenancyError> {
        let mut targets: Vec<PhysicalDatabaseTarget> =
            self.targets.iter().map(|t| t.value().clone()).collect();
        targets.sort_by_key(|t| t.id);
        Ok(targets)
    }

    async fn set_tenant_active(
        &self,
        tenant_id: TenantId,
        active: bool,
    ) -> Result<bool, TenancyError> {
        match self.tenants.get_mut(&tenant_id) {
            Some(mut record) => {
                record.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Claim on one in-memory target. Dropping it (committed or not) frees the claim slot.
#[derive(Debug)]
struct InMemoryClaim {
    store: InMemoryRegistryStore,
    target: PhysicalDatabaseTarget,
}

#[async_trait]
impl TargetClaim for InMemoryClaim {
    fn target(&self) -> &PhysicalDatabaseTarget {
        &self.target
    }

    async fn commit(self: Box<Self>, tenant: TenantRecord) -> Result<TenantRecord, TenancyError> {
        if tenant.target_id != self.target.id {
            return Err(TenancyError::Validation(format!(
                "Tenant references target {} but claim holds {}",
                tenant.target_id, self.target.id
            )));
        }

        // Reserve the code first; a duplicate leaves the target untouched.
        match self.store.codes.entry(tenant.code.clone()) {
            Entry::Occupied(_) => {
                return Err(TenancyError::Validation(format!(
                    "Tenant code already exists: {}",
                    tenant.code
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(tenant.id);
            }
        }

        match self.store.targets.get_mut(&self.target.id) {
            Some(mut target) if !target.is_allocated() => {
                target.state = TargetState::Allocated;
                target.last_allocated_at = Some(Utc::now());
            }
            _ => {
                self.store.codes.remove(&tenant.code);
                return Err(TenancyError::Storage(format!(
                    "Target {} is no longer unallocated",
                    self.target.id
                )));
            }
        }

        self.store.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn release(self: Box<Self>) -> Result<(), TenancyError> {
        Ok(())
    }
}

impl Drop for InMemoryClaim {
    fn drop(&mut self) {
        self.store.claimed.remove(&self.target.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DatabaseEngine, EncryptedSecret, NewTenant};

    fn new_target(database: &str) -> NewTarget {
        NewTarget {
            host: "db.internal".to_string(),
            port: 5432,
            username: "bookstore".to_string(),
            password: EncryptedSecret::new("00:00"),
            database: database.to_string(),
            engine: DatabaseEngine::Postgres,
        }
    }

    #[tokio::test]
    async fn test_insert_target_assigns_ids_and_rejects_duplicates() {
        let store = InMemoryRegistryStore::default();

        let first = store.insert_target(new_target("shop_1")).await.unwrap().unwrap();
        let second = store.insert_target(new_target("shop_2")).await.unwrap().unwrap();
        assert_eq!(first.id, TargetId(1));
        assert_eq!(second.id, TargetId(2));
        assert_eq!(first.state, TargetState::Unallocated);

        let duplicate = store.insert_target(new_target("shop_1")).await.unwrap();
        assert!(duplicate.is_none());
        assert_eq!(store.list_targets().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_claims_are_exclusive_and_ordered() {
        let store = InMemoryRegistryStore::default();
        store.insert_target(new_target("shop_1")).await.unwrap();
        store.insert_target(new_target("shop_2")).await.unwrap();

        let first = store.claim_unallocated_target().await.unwrap().unwrap();
        let second = store.claim_unallocated_target().await.unwrap().unwrap();
        assert_eq!(first.target().id, TargetId(1));
        assert_eq!(second.target().id, TargetId(2));
        assert!(store.claim_unallocated_target().await.unwrap().is_none());

        // Releasing makes the target claimable again
        first.release().await.unwrap();
        let again = store.claim_unallocated_target().await.unwrap().unwrap();
        assert_eq!(again.target().id, TargetId(1));
        drop(again);
        drop(second);
        assert_eq!(store.claimed_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_flips_state_and_records_tenant() {
        let store = InMemoryRegistryStore::default();
        store.insert_target(new_target("shop_1")).await.unwrap();

        let claim = store.claim_unallocated_target().await.unwrap().unwrap();
        let record = NewTenant::new("acme", "Acme")
            .into_record(claim.target().id, EncryptedSecret::new("aa:bb"));
        let committed = claim.commit(record.clone()).await.unwrap();
        assert_eq!(committed, record);

        let targets = store.list_targets().await.unwrap();
        assert_eq!(targets[0].state, TargetState::Allocated);
        assert!(targets[0].last_allocated_at.is_some());
        assert!(store.claim_unallocated_target().await.unwrap().is_none());

        let by_code = store
            .find_active_tenant(&TenantIdentifier::code("acme"))
            .await
            .unwrap()
            .unwrap();
        let by_id = store
            .find_active_tenant(&TenantIdentifier::Id(record.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_code, by_id);
        assert_eq!(by_code.target.id, TargetId(1));
    }

    #[tokio::test]
    async fn test_duplicate_code_leaves_target_unallocated() {
        let store = InMemoryRegistryStore::default();
        store.insert_target(new_target("shop_1")).await.unwrap();
        store.insert_target(new_target("shop_2")).await.unwrap();

        let claim = store.claim_unallocated_target().await.unwrap().unwrap();
        let record = NewTenant::new("acme", "Acme").into_record(claim.target().id, EncryptedSecret::new("aa:bb"));
        claim.commit(record).await.unwrap();

        let claim = store.claim_unallocated_target().await.unwrap().unwrap();
        let duplicate = NewTenant::new("acme", "Acme Again")
            .into_record(claim.target().id, EncryptedSecret::new("cc:dd"));
        let result = claim.commit(duplicate).await;
        assert!(matches!(result, Err(TenancyError::Validation(msg)) if msg.contains("already exists")));

        let targets = store.list_targets().await.unwrap();
        assert_eq!(targets[1].state, TargetState::Unallocated);
        assert_eq!(store.tenant_count(), 1);
        assert_eq!(store.claimed_count(), 0);
    }

    #[tokio::test]
    async fn test_inactive_tenants_are_invisible() {
        let store = InMemoryRegistryStore::default();
        store.insert_target(new_target("shop_1")).await.unwrap();
        let claim = store.claim_unallocated_target().await.unwrap().unwrap();
        let record = NewTenant::new("acme", "Acme").into_record(claim.target().id, EncryptedSecret::new("aa:bb"));
        claim.commit(record.clone()).await.unwrap();

        assert!(store.set_tenant_active(record.id, false).await.unwrap());
        assert!(
            store
                .find_active_tenant(&TenantIdentifier::code("acme"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(!store.set_tenant_active(TenantId::new_v4(), false).await.unwrap());
    }
}
