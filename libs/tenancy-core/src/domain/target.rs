use crate::cipher::EncryptedSecret;
use crate::TenancyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// --- Identifiers ---

/// Primary key of a pre-provisioned physical database target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub i64);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// --- Enumerations ---

/// Database engine a target speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[default]
    #[serde(alias = "postgresql", alias = "pgsql")]
    Postgres,
}

impl DatabaseEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseEngine::Postgres => "postgres",
        }
    }
}

impl FromStr for DatabaseEngine {
    type Err = TenancyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pgsql" => Ok(DatabaseEngine::Postgres),
            other => Err(TenancyError::Configuration(format!(
                "Unsupported database engine: {}",
                other
            ))),
        }
    }
}

/// Allocation state of a target. A target moves Unallocated -> Allocated once and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Unallocated,
    Allocated,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Unallocated => "unallocated",
            TargetState::Allocated => "allocated",
        }
    }
}

impl FromStr for TargetState {
    type Err = TenancyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unallocated" => Ok(TargetState::Unallocated),
            "allocated" => Ok(TargetState::Allocated),
            other => Err(TenancyError::Storage(format!(
                "Unknown target state in registry: {}",
                other
            ))),
        }
    }
}

// --- Targets ---

/// A concrete database instance registered out-of-band and available for assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDatabaseTarget {
    pub id: TargetId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: EncryptedSecret,
    pub database: String,
    pub engine: DatabaseEngine,
    pub state: TargetState,
    pub last_allocated_at: Option<DateTime<Utc>>,
}

impl PhysicalDatabaseTarget {
    pub fn is_allocated(&self) -> bool {
        self.state == TargetState::Allocated
    }
}

/// Target registration input; the store assigns the id and starts it Unallocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: EncryptedSecret,
    pub database: String,
    pub engine: DatabaseEngine,
}

/// Counts over the whole target inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct InventorySummary {
    pub total: usize,
    pub allocated: usize,
    pub unallocated: usize,
}

impl InventorySummary {
    pub fn from_targets(targets: &[PhysicalDatabaseTarget]) -> Self {
        let allocated = targets.iter().filter(|t| t.is_allocated()).count();
        Self {
            total: targets.len(),
            allocated,
            unallocated: targets.len() - allocated,
        }
    }
}

// --- Connection parameters ---

/// Everything a connector needs to open a session against one target.
/// Holds the plaintext password only for as long as the connect attempt lives.
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub database: String,
    pub engine: DatabaseEngine,
    password: String,
}

impl ConnectParams {
    pub fn new(target: &PhysicalDatabaseTarget, password: String) -> Self {
        Self {
            host: target.host.clone(),
            port: target.port,
            username: target.username.clone(),
            database: target.database.clone(),
            engine: target.engine,
            password,
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("database", &self.database)
            .field("engine", &self.engine)
            .field("password", &"<redacted>")
            .finish()
    }
}
