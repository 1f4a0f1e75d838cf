use async_trait::async_trait;
use std::error::Error as StdError;

// Declare modules
pub mod adapters;
pub mod allocator;
pub mod cipher;
pub mod config;
pub mod context;
pub mod domain;
pub mod registry;
pub mod resolver;

pub use allocator::ConnectionPoolAllocator;
pub use cipher::{CipherError, CredentialCipher, EncryptedSecret};
pub use config::{TargetSeed, TenancyConfig};
pub use context::TenancyContext;
pub use domain::{
    ConnectParams, DatabaseEngine, InventorySummary, NewTarget, NewTenant,
    PhysicalDatabaseTarget, TargetId, TargetState, TenantAssignment, TenantId, TenantIdentifier,
    TenantRecord,
};
pub use registry::TenantRegistry;
pub use resolver::{ConnectionHandle, ConnectionResolver};

// Every error the tenancy core surfaces. Cloneable so that one failed
// single-flight attempt can be handed to every waiter unchanged.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TenancyError {
    #[error("No unallocated database target left in the pool")]
    PoolExhausted,
    #[error("Database target {target_id} is unreachable: {reason}")]
    UnreachableTarget { target_id: TargetId, reason: String },
    #[error("Tenant not found: {0}")]
    TenantNotFound(TenantIdentifier),
    #[error("Failed to decrypt credential of target {target_id}: {source}")]
    Decryption {
        target_id: TargetId,
        tenant_id: Option<TenantId>,
        #[source]
        source: CipherError,
    },
    #[error("Failed to open connection for tenant {tenant_id}: {reason}")]
    ConnectionFailure { tenant_id: TenantId, reason: String },
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<sqlx::Error> for TenancyError {
    fn from(err: sqlx::Error) -> Self {
        TenancyError::Storage(err.to_string())
    }
}

/// Boxed error returned by connector implementations.
pub type ConnectorError = Box<dyn StdError + Send + Sync>;

// Port for symmetric sealing of stored credentials
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, CipherError>;
    fn decrypt(&self, blob: &EncryptedSecret) -> Result<String, CipherError>;
}

// Port for opening connections against physical targets
#[async_trait]
pub trait DatabaseConnector: Send + Sync + 'static {
    /// Long-lived session object handed to tenant-scoped business code.
    type Session: Clone + Send + Sync + 'static;

    /// Open a short-lived connection and run a trivial round-trip query.
    async fn handshake(&self, params: &ConnectParams) -> Result<(), ConnectorError>;

    /// Open the session that will be cached for the tenant.
    async fn connect(&self, params: &ConnectParams) -> Result<Self::Session, ConnectorError>;
}

/// Exclusive claim on one unallocated target, held for the duration of an allocation.
///
/// Dropping a claim without committing releases it and leaves the target untouched.
#[async_trait]
pub trait TargetClaim: Send {
    fn target(&self) -> &PhysicalDatabaseTarget;

    /// Persist the tenant and flip the claimed target to Allocated, atomically.
    async fn commit(self: Box<Self>, tenant: TenantRecord) -> Result<TenantRecord, TenancyError>;

    /// Give the target back without changing anything.
    async fn release(self: Box<Self>) -> Result<(), TenancyError>;
}

// Port for the persisted registry of targets and tenants
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Claim the first unallocated target (by id) that no one else holds.
    /// Returns None when every target is allocated or claimed.
    async fn claim_unallocated_target(&self) -> Result<Option<Box<dyn TargetClaim>>, TenancyError>;

    /// Find an active tenant by id or code, together with its target.
    async fn find_active_tenant(
        &self,
        identifier: &TenantIdentifier,
    ) -> Result<Option<TenantAssignment>, TenancyError>;

    /// Register a target. Returns None if the same host/port/database already exists.
    async fn insert_target(
        &self,
        target: NewTarget,
    ) -> Result<Option<PhysicalDatabaseTarget>, TenancyError>;

    /// All targets ordered by id.
    async fn list_targets(&self) -> Result<Vec<PhysicalDatabaseTarget>, TenancyError>;

    /// Returns false if no such tenant exists.
    async fn set_tenant_active(&self, tenant_id: TenantId, active: bool)
    -> Result<bool, TenancyError>;
}
