use crate::{
    ConnectParams, DatabaseConnector, SecretCipher, TargetId, TenancyError, TenantAssignment,
    TenantId, TenantIdentifier, TenantRegistry,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Live, reusable session for one tenant. Never persisted.
#[derive(Debug)]
pub struct ConnectionHandle<S> {
    tenant_id: TenantId,
    code: String,
    target_id: TargetId,
    session: S,
    created_at: DateTime<Utc>,
}

impl<S> ConnectionHandle<S> {
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    /// The session business code issues its queries against.
    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Process-wide cache of live tenant connections, owned by the composition root.
///
/// Handles are keyed by canonical tenant id; a code resolves through an alias index
/// filled on first success, so id and code converge on one handle. Creation is
/// single-flight per tenant id while different tenants resolve in parallel.
///
/// Nothing expires. Deactivating a tenant or rotating its credential is only seen
/// after `invalidate` or a restart.
pub struct ConnectionResolver<C: DatabaseConnector> {
    registry: TenantRegistry,
    connector: Arc<C>,
    cipher: Arc<dyn SecretCipher>,
    connect_timeout: Duration,
    handles: Cache<TenantId, Arc<ConnectionHandle<C::Session>>>,
    aliases: DashMap<String, TenantId>,
}

impl<C: DatabaseConnector> ConnectionResolver<C> {
    pub fn new(
        registry: TenantRegistry,
        connector: Arc<C>,
        cipher: Arc<dyn SecretCipher>,
        connect_timeout: Duration,
    ) -> Self {
        // No capacity bound and no TTL: entries live until invalidated.
        let handles = Cache::builder().name("tenant-connections").build();
        Self {
            registry,
            connector,
            cipher,
            connect_timeout,
            handles,
            aliases: DashMap::new(),
        }
    }

    /// Return the tenant's live handle, opening it on first use.
    pub async fn resolve(
        &self,
        identifier: &TenantIdentifier,
    ) -> Result<Arc<ConnectionHandle<C::Session>>, TenancyError> {
        if let Some(handle) = self.cached(identifier).await {
            return Ok(handle);
        }

        let assignment = self.registry.lookup(identifier).await?;
        let tenant_id = assignment.tenant.id;
        let code = assignment.tenant.code.clone();

        // Concurrent callers for the same tenant id (via any alias) wait on one init.
        // A failed init caches nothing and every waiter receives the same error.
        let handle = self
            .handles
            .try_get_with(tenant_id, self.open(assignment))
            .await
            .map_err(|e: Arc<TenancyError>| e.as_ref().clone())?;

        self.aliases.insert(code, tenant_id);
        Ok(handle)
    }

    /// Drop the cached handle for a tenant and every alias pointing at it.
    /// Sessions still held by callers stay usable until they are dropped.
    /// Returns whether a handle was cached.
    pub async fn invalidate(&self, tenant_id: TenantId) -> bool {
        let removed = self.handles.remove(&tenant_id).await.is_some();
        self.aliases.retain(|_, id| *id != tenant_id);
        if removed {
            info!(%tenant_id, "Tenant connection invalidated");
        }
        removed
    }

    pub fn is_cached(&self, tenant_id: &TenantId) -> bool {
        self.handles.contains_key(tenant_id)
    }

    async fn cached(
        &self,
        identifier: &TenantIdentifier,
    ) -> Option<Arc<ConnectionHandle<C::Session>>> {
        let tenant_id = match identifier {
            TenantIdentifier::Id(id) => *id,
            TenantIdentifier::Code(code) => *self.aliases.get(code)?.value(),
        };
        self.handles.get(&tenant_id).await
    }

    async fn open(
        &self,
        assignment: TenantAssignment,
    ) -> Result<Arc<ConnectionHandle<C::Session>>, TenancyError> {
        let TenantAssignment { tenant, target } = assignment;

        let password = self.cipher.decrypt(&tenant.credential).map_err(|source| {
            warn!(tenant_id = %tenant.id, target_id = %target.id, "Stored tenant credential cannot be decrypted");
            TenancyError::Decryption {
                target_id: target.id,
                tenant_id: Some(tenant.id),
                source,
            }
        })?;
        let params = ConnectParams::new(&target, password);

        debug!(tenant_id = %tenant.id, host = %target.host, database = %target.database, "Opening tenant connection");
        let session = match timeout(self.connect_timeout, self.connector.connect(&params)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(tenant_id = %tenant.id, error = %e, "Tenant connection failed");
                return Err(TenancyError::ConnectionFailure {
                    tenant_id: tenant.id,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(tenant_id = %tenant.id, "Tenant connection timed out");
                return Err(TenancyError::ConnectionFailure {
                    tenant_id: tenant.id,
                    reason: format!(
                        "connection timed out after {}ms",
                        self.connect_timeout.as_millis()
                    ),
                });
            }
        };
        drop(params);

        info!(tenant_id = %tenant.id, code = %tenant.code, target_id = %target.id, "Tenant connection opened");
        Ok(Arc::new(ConnectionHandle {
            tenant_id: tenant.id,
            code: tenant.code,
            target_id: target.id,
            session,
            created_at: Utc::now(),
        }))
    }
}
