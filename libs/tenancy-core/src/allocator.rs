use crate::config::TargetSeed;
use crate::{
    ConnectParams, DatabaseConnector, InventorySummary, NewTenant, RegistryStore, SecretCipher,
    TargetClaim, TenancyError, TenantRecord,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Owns the finite inventory of physical targets and hands each one to at most one tenant.
///
/// Selection is deterministic: the lowest-id unallocated target not currently claimed
/// by a concurrent allocation. Claim, handshake and commit run as one unit; any
/// failure or cancellation before commit leaves the registry untouched.
pub struct ConnectionPoolAllocator<C: DatabaseConnector> {
    store: Arc<dyn RegistryStore>,
    connector: Arc<C>,
    cipher: Arc<dyn SecretCipher>,
    handshake_timeout: Duration,
}

impl<C: DatabaseConnector> ConnectionPoolAllocator<C> {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        connector: Arc<C>,
        cipher: Arc<dyn SecretCipher>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            store,
            connector,
            cipher,
            handshake_timeout,
        }
    }

    /// Assign one unallocated target to a new tenant.
    pub async fn allocate(&self, descriptor: NewTenant) -> Result<TenantRecord, TenancyError> {
        descriptor.validate()?;

        let claim = self
            .store
            .claim_unallocated_target()
            .await?
            .ok_or(TenancyError::PoolExhausted)?;
        let target_id = claim.target().id;

        let params = match self.cipher.decrypt(&claim.target().password) {
            Ok(password) => ConnectParams::new(claim.target(), password),
            Err(source) => {
                release(claim).await;
                return Err(TenancyError::Decryption {
                    target_id,
                    tenant_id: None,
                    source,
                });
            }
        };

        let reason = match timeout(self.handshake_timeout, self.connector.handshake(&params)).await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "handshake timed out after {}ms",
                self.handshake_timeout.as_millis()
            )),
        };
        if let Some(reason) = reason {
            warn!(%target_id, code = %descriptor.code, %reason, "Target failed allocation handshake");
            release(claim).await;
            return Err(TenancyError::UnreachableTarget { target_id, reason });
        }

        // The tenant gets its own sealed copy of the credential (fresh IV).
        let credential = match self.cipher.encrypt(params.password()) {
            Ok(credential) => credential,
            Err(e) => {
                release(claim).await;
                return Err(TenancyError::Configuration(format!(
                    "Cannot seal tenant credential: {}",
                    e
                )));
            }
        };
        drop(params);

        let record = claim
            .commit(descriptor.into_record(target_id, credential))
            .await?;
        info!(tenant_id = %record.id, code = %record.code, %target_id, "Tenant allocated");
        Ok(record)
    }

    /// Register bootstrap targets not yet known to the registry. Returns how many were added.
    pub async fn seed_targets(&self, seeds: &[TargetSeed]) -> Result<usize, TenancyError> {
        let mut inserted = 0;
        for seed in seeds {
            let target = seed
                .seal(self.cipher.as_ref())
                .map_err(|e| TenancyError::Configuration(format!("Cannot seal seed password: {}", e)))?;
            match self.store.insert_target(target).await? {
                Some(target) => {
                    info!(target_id = %target.id, host = %target.host, database = %target.database, "Target registered");
                    inserted += 1;
                }
                None => {
                    info!(host = %seed.host, database = %seed.database, "Target already registered, skipping");
                }
            }
        }
        Ok(inserted)
    }

    pub async fn inventory(&self) -> Result<InventorySummary, TenancyError> {
        let targets = self.store.list_targets().await?;
        Ok(InventorySummary::from_targets(&targets))
    }
}

async fn release(claim: Box<dyn TargetClaim>) {
    let target_id = claim.target().id;
    if let Err(e) = claim.release().await {
        // The claim is dropped either way, which also releases it.
        warn!(%target_id, error = %e, "Failed to release target claim cleanly");
    }
}
