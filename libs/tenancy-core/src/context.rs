use crate::adapters::{PostgresConnector, PostgresRegistryStore};
use crate::{
    ConnectionPoolAllocator, ConnectionResolver, CredentialCipher, DatabaseConnector,
    RegistryStore, SecretCipher, TenancyConfig, TenancyError, TenantRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// Holds the shared tenancy components. Build one per process and clone it freely.
pub struct TenancyContext<C: DatabaseConnector> {
    pub store: Arc<dyn RegistryStore>,
    pub registry: TenantRegistry,
    pub allocator: Arc<ConnectionPoolAllocator<C>>,
    pub resolver: Arc<ConnectionResolver<C>>,
}

impl<C: DatabaseConnector> Clone for TenancyContext<C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            allocator: self.allocator.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

impl<C: DatabaseConnector> TenancyContext<C> {
    /// Wire the components over one store, connector and cipher.
    pub fn new(
        store: Arc<dyn RegistryStore>,
        connector: C,
        cipher: Arc<dyn SecretCipher>,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Self {
        let connector = Arc::new(connector);
        let registry = TenantRegistry::new(store.clone());
        let allocator = ConnectionPoolAllocator::new(
            store.clone(),
            connector.clone(),
            cipher.clone(),
            handshake_timeout,
        );
        let resolver = ConnectionResolver::new(registry.clone(), connector, cipher, connect_timeout);
        Self {
            store,
            registry,
            allocator: Arc::new(allocator),
            resolver: Arc::new(resolver),
        }
    }
}

impl TenancyContext<PostgresConnector> {
    /// Connect to the registry database, apply migrations and wire the Postgres adapters.
    pub async fn connect(config: &TenancyConfig) -> Result<Self, TenancyError> {
        let cipher = CredentialCipher::from_secret(&config.cipher_secret)?;

        let store =
            PostgresRegistryStore::connect(&config.database_url, config.registry_max_connections)
                .await?;
        store.run_migrations().await?;
        info!("Tenant registry ready");

        let connector =
            PostgresConnector::new(config.max_tenant_connections, config.connect_timeout);
        Ok(Self::new(
            Arc::new(store),
            connector,
            Arc::new(cipher),
            config.connect_timeout,
            config.handshake_timeout,
        ))
    }
}
