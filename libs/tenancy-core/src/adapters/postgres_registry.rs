use crate::{
    EncryptedSecret, NewTarget, PhysicalDatabaseTarget, RegistryStore, TargetClaim, TargetId,
    TargetState, TenancyError, TenantAssignment, TenantId, TenantIdentifier, TenantRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

const TARGET_COLUMNS: &str = "id, host, port, username, encrypted_password, database_name, engine, state, last_allocated_at";

// Rows matching the registry schema in ./migrations
#[derive(sqlx::FromRow, Debug)]
struct TargetRow {
    id: i64,
    host: String,
    port: i32,
    username: String,
    encrypted_password: String,
    database_name: String,
    engine: String,
    state: String,
    last_allocated_at: Option<DateTime<Utc>>,
}

impl TryFrom<TargetRow> for PhysicalDatabaseTarget {
    type Error = TenancyError;

    fn try_from(row: TargetRow) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port).map_err(|_| {
            TenancyError::Storage(format!("Target {} has invalid port {}", row.id, row.port))
        })?;
        Ok(PhysicalDatabaseTarget {
            id: TargetId(row.id),
            host: row.host,
            port,
            username: row.username,
            password: EncryptedSecret::new(row.encrypted_password),
            database: row.database_name,
            engine: row.engine.parse()?,
            state: row.state.parse()?,
            last_allocated_at: row.last_allocated_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct AssignmentRow {
    tenant_id: Uuid,
    code: String,
    name: String,
    encrypted_credential: String,
    active: bool,
    created_at: DateTime<Utc>,
    #[sqlx(flatten)]
    target: TargetRow,
}

impl TryFrom<AssignmentRow> for TenantAssignment {
    type Error = TenancyError;

    fn try_from(row: AssignmentRow) -> Result<Self, Self::Error> {
        let target = PhysicalDatabaseTarget::try_from(row.target)?;
        Ok(TenantAssignment {
            tenant: TenantRecord {
                id: TenantId(row.tenant_id),
                code: row.code,
                name: row.name,
                target_id: target.id,
                credential: EncryptedSecret::new(row.encrypted_credential),
                active: row.active,
                created_at: row.created_at,
            },
            target,
        })
    }
}

/// PostgreSQL implementation of the RegistryStore port using sqlx.
#[derive(Debug, Clone)]
pub struct PostgresRegistryStore {
    pool: PgPool,
}

impl PostgresRegistryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the registry database.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, TenancyError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| {
                TenancyError::Configuration(format!("Cannot reach registry database: {}", e))
            })?;
        info!("Connected to tenant registry database");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the registry schema migrations.
    pub async fn run_migrations(&self) -> Result<(), TenancyError> {
        info!("Applying registry migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TenancyError::Storage(format!("Migration failed: {}", e)))?;
        info!("Registry migrations applied.");
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for PostgresRegistryStore {
    async fn claim_unallocated_target(&self) -> Result<Option<Box<dyn TargetClaim>>, TenancyError> {
        let mut tx = self.pool.begin().await?;

        // Row lock held until commit/rollback; concurrent claimers skip it and take the next one.
        let query = format!(
            "SELECT {} FROM database_targets WHERE state = 'unallocated' ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED",
            TARGET_COLUMNS
        );
        let row: Option<TargetRow> = sqlx::query_as(&query).fetch_optional(&mut *tx).await?;

        match row {
            Some(row) => {
                let target = PhysicalDatabaseTarget::try_from(row)?;
                debug!(target_id = %target.id, "Claimed unallocated target");
                Ok(Some(Box::new(PostgresClaim { tx, target })))
            }
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    async fn find_active_tenant(
        &self,
        identifier: &TenantIdentifier,
    ) -> Result<Option<TenantAssignment>, TenancyError> {
        let select = "SELECT t.id AS tenant_id, t.code, t.name, t.encrypted_credential, t.active, t.created_at, \
             d.id, d.host, d.port, d.username, d.encrypted_password, d.database_name, d.engine, d.state, d.last_allocated_at \
             FROM tenants t JOIN database_targets d ON d.id = t.target_id";

        let row: Option<AssignmentRow> = match identifier {
            TenantIdentifier::Id(id) => {
                sqlx::query_as(&format!("{} WHERE t.id = $1 AND t.active", select))
                    .bind(id.0)
                    .fetch_optional(&self.pool)
                    .await?
            }
            TenantIdentifier::Code(code) => {
                sqlx::query_as(&format!("{} WHERE t.code = $1 AND t.active", select))
                    .bind(code)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        row.map(TenantAssignment::try_from).transpose()
    }

    async fn insert_target(
        &self,
        target: NewTarget,
    ) -> Result<Option<PhysicalDatabaseTarget>, TenancyError> {
        let query = format!(
            "INSERT INTO database_targets (host, port, username, encrypted_password, database_name, engine, state) \
             VALUES ($1, $2, $3, $4, $5, $6, 'unallocated') \
             ON CONFLICT (host, port, database_name) DO NOTHING \
             RETURNING {}",
            TARGET_COLUMNS
        );
        let row: Option<TargetRow> = sqlx::query_as(&query)
            .bind(&target.host)
            .bind(i32::from(target.port))
            .bind(&target.username)
            .bind(target.password.as_str())
            .bind(&target.database)
            .bind(target.engine.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(PhysicalDatabaseTarget::try_from).transpose()
    }

    async fn list_targets(&self) -> Result<Vec<PhysicalDatabaseTarget>, TenancyError> {
        let query = format!("SELECT {} FROM database_targets ORDER BY id ASC", TARGET_COLUMNS);
        let rows: Vec<TargetRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;
        rows.into_iter().map(PhysicalDatabaseTarget::try_from).collect()
    }

    async fn set_tenant_active(
        &self,
        tenant_id: TenantId,
        active: bool,
    ) -> Result<bool, TenancyError> {
        let result = sqlx::query("UPDATE tenants SET active = $2 WHERE id = $1")
            .bind(tenant_id.0)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Open transaction holding the row lock on one target.
/// Dropping it rolls the transaction back, which releases the lock.
struct PostgresClaim {
    tx: Transaction<'static, Postgres>,
    target: PhysicalDatabaseTarget,
}

#[async_trait]
impl TargetClaim for PostgresClaim {
    fn target(&self) -> &PhysicalDatabaseTarget {
        &self.target
    }

    async fn commit(self: Box<Self>, tenant: TenantRecord) -> Result<TenantRecord, TenancyError> {
        let PostgresClaim { mut tx, target } = *self;

        if tenant.target_id != target.id {
            return Err(TenancyError::Validation(format!(
                "Tenant references target {} but claim holds {}",
                tenant.target_id, target.id
            )));
        }

        // 1. Insert the tenant row
        let inserted = sqlx::query(
            "INSERT INTO tenants (id, code, name, target_id, encrypted_credential, active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(tenant.id.0)
        .bind(&tenant.code)
        .bind(&tenant.name)
        .bind(tenant.target_id.0)
        .bind(tenant.credential.as_str())
        .bind(tenant.active)
        .bind(tenant.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            let duplicate = e
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation());
            tx.rollback().await?;
            if duplicate {
                return Err(TenancyError::Validation(format!(
                    "Tenant code already exists: {}",
                    tenant.code
                )));
            }
            return Err(e.into());
        }

        // 2. Flip the target; the row lock guarantees nobody else changed it
        let flipped = sqlx::query(
            "UPDATE database_targets SET state = 'allocated', last_allocated_at = NOW() \
             WHERE id = $1 AND state = 'unallocated'",
        )
        .bind(target.id.0)
        .execute(&mut *tx)
        .await?;

        if flipped.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(TenancyError::Storage(format!(
                "Target {} is no longer unallocated",
                target.id
            )));
        }

        // 3. Commit
        tx.commit().await?;
        Ok(tenant)
    }

    async fn release(self: Box<Self>) -> Result<(), TenancyError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
