use crate::{ConnectParams, ConnectorError, DatabaseConnector};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Session produced by the in-memory connector. `serial` is unique per connect call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemorySession {
    pub serial: u64,
    pub host: String,
    pub database: String,
    pub username: String,
}

/// Connector that never touches the network.
/// Suitable for testing and single-process mode: counts calls, can simulate
/// unreachable hosts, rejected passwords and slow handshakes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConnector {
    unreachable_hosts: Arc<DashSet<String>>,
    expected_passwords: Arc<DashMap<String, String>>,
    latency: Duration,
    handshakes: Arc<AtomicU64>,
    connects: Arc<AtomicU64>,
}

impl InMemoryConnector {
    /// Every handshake and connect sleeps for `latency` before answering.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn mark_unreachable(&self, host: &str) {
        self.unreachable_hosts.insert(host.to_string());
    }

    pub fn mark_reachable(&self, host: &str) {
        self.unreachable_hosts.remove(host);
    }

    /// Require `password` when connecting to `database`; anything else is refused.
    pub fn expect_password(&self, database: &str, password: &str) {
        self.expected_passwords
            .insert(database.to_string(), password.to_string());
    }

    pub fn handshake_count(&self) -> u64 {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    async fn check(&self, params: &ConnectParams) -> Result<(), ConnectorError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.unreachable_hosts.contains(&params.host) {
            return Err(format!("connection refused by {}:{}", params.host, params.port).into());
        }
        if let Some(expected) = self.expected_passwords.get(&params.database) {
            if expected.value() != params.password() {
                return Err(format!(
                    "password authentication failed for user \"{}\"",
                    params.username
                )
                .into());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnector for InMemoryConnector {
    type Session = InMemorySession;

    async fn handshake(&self, params: &ConnectParams) -> Result<(), ConnectorError> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        self.check(params).await
    }

    async fn connect(&self, params: &ConnectParams) -> Result<Self::Session, ConnectorError> {
        let serial = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.check(params).await?;
        Ok(InMemorySession {
            serial,
            host: params.host.clone(),
            database: params.database.clone(),
            username: params.username.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DatabaseEngine, EncryptedSecret, PhysicalDatabaseTarget, TargetId, TargetState};

    fn params(host: &str, password: &str) -> ConnectParams {
        let target = PhysicalDatabaseTarget {
            id: TargetId(1),
            host: host.to_string(),
            port: 5432,
            username: "bookstore".to_string(),
            password: EncryptedSecret::new("00:00"),
            database: "shop_1".to_string(),
            engine: DatabaseEngine::Postgres,
            state: TargetState::Unallocated,
            last_allocated_at: None,
        };
        ConnectParams::new(&target, password.to_string())
    }

    #[tokio::test]
    async fn test_connect_counts_and_serials() {
        let connector = InMemoryConnector::default();
        let first = connector.connect(&params("db-a", "pw")).await.unwrap();
        let second = connector.connect(&params("db-a", "pw")).await.unwrap();
        assert_eq!(first.serial, 1);
        assert_eq!(second.serial, 2);
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(connector.handshake_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_until_restored() {
        let connector = InMemoryConnector::default();
        connector.mark_unreachable("db-a");
        assert!(connector.handshake(&params("db-a", "pw")).await.is_err());
        assert!(connector.handshake(&params("db-b", "pw")).await.is_ok());

        connector.mark_reachable("db-a");
        assert!(connector.handshake(&params("db-a", "pw")).await.is_ok());
        assert_eq!(connector.handshake_count(), 3);
    }

    #[tokio::test]
    async fn test_expected_password_is_enforced() {
        let connector = InMemoryConnector::default();
        connector.expect_password("shop_1", "right");
        assert!(connector.connect(&params("db-a", "right")).await.is_ok());
        let err = connector.connect(&params("db-a", "wrong")).await.unwrap_err();
        assert!(err.to_string().contains("password authentication failed"));
    }
}
