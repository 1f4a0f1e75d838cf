pub mod target;
pub mod tenant;

pub use target::{
    ConnectParams, DatabaseEngine, InventorySummary, NewTarget, PhysicalDatabaseTarget, TargetId,
    TargetState,
};
pub use tenant::{NewTenant, TenantAssignment, TenantId, TenantIdentifier, TenantRecord};
