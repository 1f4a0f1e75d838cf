use super::target::{PhysicalDatabaseTarget, TargetId};
use crate::cipher::EncryptedSecret;
use crate::TenancyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const MAX_CODE_LEN: usize = 64;

// --- Identifiers ---

/// Canonical tenant identifier. Every cache and registry key uses this, never the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = TenancyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TenantId)
            .map_err(|e| TenancyError::Validation(format!("Invalid tenant id '{}': {}", s, e)))
    }
}

/// How callers name a tenant: by canonical id or by its human-readable code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TenantIdentifier {
    Id(TenantId),
    Code(String),
}

impl TenantIdentifier {
    /// Anything that parses as a UUID is an id; everything else is treated as a code.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match Uuid::parse_str(raw) {
            Ok(uuid) => TenantIdentifier::Id(TenantId(uuid)),
            Err(_) => TenantIdentifier::Code(raw.to_string()),
        }
    }

    pub fn code(code: impl Into<String>) -> Self {
        TenantIdentifier::Code(code.into())
    }
}

impl From<TenantId> for TenantIdentifier {
    fn from(id: TenantId) -> Self {
        TenantIdentifier::Id(id)
    }
}

impl fmt::Display for TenantIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantIdentifier::Id(id) => write!(f, "id {}", id),
            TenantIdentifier::Code(code) => write!(f, "code '{}'", code),
        }
    }
}

// --- Records ---

/// Persisted tenant row: exactly one target, plus the tenant's own sealed credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRecord {
    pub id: TenantId,
    pub code: String,
    pub name: String,
    pub target_id: TargetId,
    pub credential: EncryptedSecret,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl TenantRecord {
    pub fn matches(&self, identifier: &TenantIdentifier) -> bool {
        match identifier {
            TenantIdentifier::Id(id) => self.id == *id,
            TenantIdentifier::Code(code) => self.code == *code,
        }
    }
}

/// A tenant together with the target it was assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantAssignment {
    pub tenant: TenantRecord,
    pub target: PhysicalDatabaseTarget,
}

/// Descriptor handed to the allocator by the tenant-creation workflow.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewTenant {
    pub code: String,
    pub name: String,
}

impl NewTenant {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }

    pub fn validate(&self) -> Result<(), TenancyError> {
        if self.code.is_empty() {
            return Err(TenancyError::Validation("Tenant code cannot be empty".into()));
        }
        if self.code.len() > MAX_CODE_LEN {
            return Err(TenancyError::Validation(format!(
                "Tenant code cannot exceed {} characters",
                MAX_CODE_LEN
            )));
        }
        if !self
            .code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(TenancyError::Validation(format!(
                "Tenant code '{}' may only contain ASCII letters, digits, '-' and '_'",
                self.code
            )));
        }
        // A code that parses as a UUID could never be looked up by code.
        if Uuid::parse_str(&self.code).is_ok() {
            return Err(TenancyError::Validation(
                "Tenant code cannot be a UUID".into(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(TenancyError::Validation("Tenant name cannot be empty".into()));
        }
        Ok(())
    }

    pub fn into_record(self, target_id: TargetId, credential: EncryptedSecret) -> TenantRecord {
        TenantRecord {
            id: TenantId::new_v4(),
            code: self.code,
            name: self.name,
            target_id,
            credential,
            active: true,
            created_at: Utc::now(),
        }
    }
}
