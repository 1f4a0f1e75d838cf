use crate::{CipherError, DatabaseEngine, NewTarget, SecretCipher, TenancyError};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_CIPHER_SECRET: &str = "TENANCY_CIPHER_SECRET";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "TENANCY_CONNECT_TIMEOUT_MS";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "TENANCY_HANDSHAKE_TIMEOUT_MS";
pub const ENV_MAX_TENANT_CONNECTIONS: &str = "TENANCY_MAX_TENANT_CONNECTIONS";
pub const ENV_REGISTRY_MAX_CONNECTIONS: &str = "TENANCY_REGISTRY_MAX_CONNECTIONS";
pub const ENV_BOOTSTRAP_TARGETS: &str = "TENANCY_BOOTSTRAP_TARGETS";

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_TENANT_CONNECTIONS: u32 = 5;
const DEFAULT_REGISTRY_MAX_CONNECTIONS: u32 = 5;

/// Settings for the tenancy core, read once at process start.
#[derive(Clone)]
pub struct TenancyConfig {
    /// Registry database holding targets and tenants.
    pub database_url: String,
    /// Secret material the credential key is derived from.
    pub cipher_secret: String,
    /// Upper bound on opening a tenant session.
    pub connect_timeout: Duration,
    /// Upper bound on the allocation handshake.
    pub handshake_timeout: Duration,
    /// Pool size of each tenant's session.
    pub max_tenant_connections: u32,
    pub registry_max_connections: u32,
    /// JSON file listing the targets to seed, if any.
    pub bootstrap_targets: Option<PathBuf>,
}

impl TenancyConfig {
    /// Reads the process environment. Call `dotenvy::dotenv()` beforehand to honour `.env`.
    pub fn from_env() -> Result<Self, TenancyError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, TenancyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, TenancyError> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| TenancyError::Configuration(format!("{} must be set", key)))
        };

        Ok(Self {
            database_url: required(ENV_DATABASE_URL)?,
            cipher_secret: required(ENV_CIPHER_SECRET)?,
            connect_timeout: Duration::from_millis(parse_or(
                &lookup,
                ENV_CONNECT_TIMEOUT_MS,
                DEFAULT_CONNECT_TIMEOUT_MS,
            )?),
            handshake_timeout: Duration::from_millis(parse_or(
                &lookup,
                ENV_HANDSHAKE_TIMEOUT_MS,
                DEFAULT_HANDSHAKE_TIMEOUT_MS,
            )?),
            max_tenant_connections: parse_or(
                &lookup,
                ENV_MAX_TENANT_CONNECTIONS,
                DEFAULT_MAX_TENANT_CONNECTIONS,
            )?,
            registry_max_connections: parse_or(
                &lookup,
                ENV_REGISTRY_MAX_CONNECTIONS,
                DEFAULT_REGISTRY_MAX_CONNECTIONS,
            )?,
            bootstrap_targets: lookup(ENV_BOOTSTRAP_TARGETS)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

impl fmt::Debug for TenancyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenancyConfig")
            .field("database_url", &"<redacted>")
            .field("cipher_secret", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_tenant_connections", &self.max_tenant_connections)
            .field("registry_max_connections", &self.registry_max_connections)
            .field("bootstrap_targets", &self.bootstrap_targets)
            .finish()
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, TenancyError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: fmt::Display,
{
    let value = match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|e| {
            TenancyError::Configuration(format!("{} is not a valid number: {}", key, e))
        })?,
        _ => default,
    };
    if value <= T::default() {
        return Err(TenancyError::Configuration(format!(
            "{} must be greater than zero",
            key
        )));
    }
    Ok(value)
}

// --- Bootstrap targets ---

fn default_port() -> u16 {
    5432
}

/// One entry of the bootstrap target list, as written by operators.
#[derive(Clone, Deserialize)]
pub struct TargetSeed {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub engine: DatabaseEngine,
}

impl TargetSeed {
    /// Seal the password so the plaintext never reaches the registry.
    pub fn seal(&self, cipher: &dyn SecretCipher) -> Result<NewTarget, CipherError> {
        Ok(NewTarget {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: cipher.encrypt(&self.password)?,
            database: self.database.clone(),
            engine: self.engine,
        })
    }
}

impl fmt::Debug for TargetSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetSeed")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("engine", &self.engine)
            .finish()
    }
}

pub fn parse_target_seeds(json: &str) -> Result<Vec<TargetSeed>, TenancyError> {
    serde_json::from_str(json)
        .map_err(|e| TenancyError::Configuration(format!("Invalid bootstrap target list: {}", e)))
}

pub fn load_target_seeds(path: &Path) -> Result<Vec<TargetSeed>, TenancyError> {
    let json = std::fs::read_to_string(path).map_err(|e| {
        TenancyError::Configuration(format!("Cannot read {}: {}", path.display(), e))
    })?;
    parse_target_seeds(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CredentialCipher;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_apply() {
        let config = TenancyConfig::from_lookup(lookup_from(&[
            (ENV_DATABASE_URL, "postgres://localhost/registry"),
            (ENV_CIPHER_SECRET, "app-key"),
        ]))
        .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(5_000));
        assert_eq!(config.handshake_timeout, Duration::from_millis(5_000));
        assert_eq!(config.max_tenant_connections, 5);
        assert!(config.bootstrap_targets.is_none());
    }

    #[test]
    fn test_overrides_apply() {
        let config = TenancyConfig::from_lookup(lookup_from(&[
            (ENV_DATABASE_URL, "postgres://localhost/registry"),
            (ENV_CIPHER_SECRET, "app-key"),
            (ENV_CONNECT_TIMEOUT_MS, "250"),
            (ENV_HANDSHAKE_TIMEOUT_MS, " 1500 "),
            (ENV_MAX_TENANT_CONNECTIONS, "2"),
            (ENV_BOOTSTRAP_TARGETS, "/etc/tenancy/targets.json"),
        ]))
        .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_tenant_connections, 2);
        assert_eq!(
            config.bootstrap_targets,
            Some(PathBuf::from("/etc/tenancy/targets.json"))
        );
    }

    #[test]
    fn test_missing_and_invalid_values_are_rejected() {
        let missing_secret =
            TenancyConfig::from_lookup(lookup_from(&[(ENV_DATABASE_URL, "postgres://x")]));
        assert!(
            matches!(missing_secret, Err(TenancyError::Configuration(msg)) if msg.contains(ENV_CIPHER_SECRET))
        );

        let bad_timeout = TenancyConfig::from_lookup(lookup_from(&[
            (ENV_DATABASE_URL, "postgres://x"),
            (ENV_CIPHER_SECRET, "k"),
            (ENV_CONNECT_TIMEOUT_MS, "soon"),
        ]));
        assert!(matches!(bad_timeout, Err(TenancyError::Configuration(_))));

        let zero_timeout = TenancyConfig::from_lookup(lookup_from(&[
            (ENV_DATABASE_URL, "postgres://x"),
            (ENV_CIPHER_SECRET, "k"),
            (ENV_HANDSHAKE_TIMEOUT_MS, "0"),
        ]));
        assert!(matches!(zero_timeout, Err(TenancyError::Configuration(_))));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = TenancyConfig::from_lookup(lookup_from(&[
            (ENV_DATABASE_URL, "postgres://admin:pw@localhost/registry"),
            (ENV_CIPHER_SECRET, "app-key"),
        ]))
        .unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("app-key"));
        assert!(!rendered.contains("admin:pw"));
    }

    #[test]
    fn test_target_seeds_parse_and_seal() {
        let seeds = parse_target_seeds(
            r#"[
                {"host": "db-1.internal", "username": "shop", "password": "pw1", "database": "shop_1"},
                {"host": "db-2.internal", "port": 6432, "username": "shop", "password": "pw2", "database": "shop_2", "engine": "postgresql"}
            ]"#,
        )
        .unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].port, 5432);
        assert_eq!(seeds[1].port, 6432);
        assert!(!format!("{:?}", seeds[0]).contains("pw1"));

        let cipher = CredentialCipher::from_secret("app-key").unwrap();
        let sealed = seeds[1].seal(&cipher).unwrap();
        assert_ne!(sealed.password.as_str(), "pw2");
        assert_eq!(cipher.decrypt(&sealed.password).unwrap(), "pw2");
    }

    #[test]
    fn test_invalid_seed_json_is_configuration_error() {
        assert!(matches!(
            parse_target_seeds(r#"[{"host": "db"}]"#),
            Err(TenancyError::Configuration(_))
        ));
    }
}
