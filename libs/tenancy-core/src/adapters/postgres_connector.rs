use crate::{ConnectParams, ConnectorError, DatabaseConnector, DatabaseEngine};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool};
use std::time::Duration;
use tracing::debug;

const APPLICATION_NAME: &str = "tenancy-core";

/// Connector that opens one dedicated `PgPool` per tenant, bound to the tenant's own database.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PostgresConnector {
    pub fn new(max_connections: u32, acquire_timeout: Duration) -> Self {
        Self {
            max_connections,
            acquire_timeout,
        }
    }

    fn connect_options(params: &ConnectParams) -> PgConnectOptions {
        match params.engine {
            DatabaseEngine::Postgres => PgConnectOptions::new()
                .host(&params.host)
                .port(params.port)
                .username(&params.username)
                .password(params.password())
                .database(&params.database)
                .application_name(APPLICATION_NAME),
        }
    }
}

impl Default for PostgresConnector {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

#[async_trait]
impl DatabaseConnector for PostgresConnector {
    type Session = PgPool;

    async fn handshake(&self, params: &ConnectParams) -> Result<(), ConnectorError> {
        let mut conn = PgConnection::connect_with(&Self::connect_options(params)).await?;
        let answer: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&mut conn).await?;
        conn.close().await?;
        if answer != 1 {
            return Err(format!("unexpected handshake answer {}", answer).into());
        }
        debug!(host = %params.host, database = %params.database, "Handshake succeeded");
        Ok(())
    }

    async fn connect(&self, params: &ConnectParams) -> Result<Self::Session, ConnectorError> {
        // connect_with opens the first connection eagerly, so bad credentials fail here
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(Self::connect_options(params))
            .await?;
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EncryptedSecret, PhysicalDatabaseTarget, TargetId, TargetState};
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::postgres::Postgres as PostgresImage;
    use tokio::time::timeout;

    fn params(host: &str, port: u16, password: &str) -> ConnectParams {
        let target = PhysicalDatabaseTarget {
            id: TargetId(1),
            host: host.to_string(),
            port,
            username: "postgres".to_string(),
            password: EncryptedSecret::new("00:00"),
            database: "postgres".to_string(),
            engine: DatabaseEngine::Postgres,
            state: TargetState::Unallocated,
            last_allocated_at: None,
        };
        ConnectParams::new(&target, password.to_string())
    }

    #[tokio::test]
    async fn test_handshake_against_closed_port_fails() {
        let connector = PostgresConnector::default();
        let result = timeout(
            Duration::from_secs(10),
            connector.handshake(&params("127.0.0.1", 1, "postgres")),
        )
        .await;
        assert!(!matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_handshake_and_connect_postgres() {
        let node = PostgresImage::default()
            .start()
            .await
            .expect("Failed to start Postgres container");
        let port = node
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get host port");
        let connector = PostgresConnector::new(2, Duration::from_secs(5));

        connector
            .handshake(&params("localhost", port, "postgres"))
            .await
            .expect("handshake should succeed");

        let pool = connector
            .connect(&params("localhost", port, "postgres"))
            .await
            .expect("connect should succeed");
        let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
    }
}
