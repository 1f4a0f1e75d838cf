// Declare modules within the adapters directory
pub mod in_memory_connector;
pub mod in_memory_registry;
pub mod postgres_connector;
pub mod postgres_registry;

pub use in_memory_connector::{InMemoryConnector, InMemorySession};
pub use in_memory_registry::InMemoryRegistryStore;
pub use postgres_connector::PostgresConnector;
pub use postgres_registry::PostgresRegistryStore;
