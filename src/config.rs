//! Agent configuration
//!
//! [`AgentConfig::load`] reads `config/agent.toml` if present and then
//! `SCHEMAGUARD__*` environment variables, with `__` separating nested keys
//! (`SCHEMAGUARD__METADATA__URL`, `SCHEMAGUARD__RATE_LIMIT__REQUESTS`).
//! Every field has a default, so an empty environment yields a usable
//! configuration.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub use crate::pool::config::*;

pub const DEFAULT_CONFIG_FILE: &str = "config/agent.toml";
pub const ENV_PREFIX: &str = "SCHEMAGUARD";

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Calls allowed per client within one window
    #[serde(default = "default_rate_limit_requests")]
    pub requests: usize,
    #[serde(default = "default_rate_limit_window_seconds")]
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: default_rate_limit_requests(),
            window_seconds: default_rate_limit_window_seconds(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Sizing of the per-target pools
#[derive(Debug, Clone, Deserialize)]
pub struct TargetPoolConfig {
    #[serde(default = "default_target_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_pool_timeout_seconds")]
    pub pool_timeout_seconds: u64,
}

impl Default for TargetPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_target_max_connections(),
            pool_timeout_seconds: default_pool_timeout_seconds(),
        }
    }
}

impl TargetPoolConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_secs(self.pool_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// The agent's own metadata database
    #[serde(default)]
    pub metadata: DatabaseConfig,
    #[serde(default)]
    pub targets: TargetPoolConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Deadline for each statement run on a target; none when unset
    #[serde(default)]
    pub statement_timeout_seconds: Option<u64>,
    #[serde(default = "default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
    /// Create the metadata tables at startup
    #[serde(default = "default_true")]
    pub initialize_schema: bool,
    /// Coroutine worker threads; the runtime's default when unset
    #[serde(default)]
    pub workers: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            metadata: DatabaseConfig::default(),
            targets: TargetPoolConfig::default(),
            rate_limit: RateLimitConfig::default(),
            statement_timeout_seconds: None,
            lock_timeout_seconds: default_lock_timeout_seconds(),
            initialize_schema: true,
            workers: None,
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:7437".to_string()
}

fn default_rate_limit_requests() -> usize {
    100
}

fn default_rate_limit_window_seconds() -> u64 {
    60
}

fn default_target_max_connections() -> usize {
    4
}

fn default_pool_timeout_seconds() -> u64 {
    30
}

fn default_lock_timeout_seconds() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// Load from `config/agent.toml` (optional) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from `path` (optional) and the environment. A file that exists
    /// but cannot be read is reported and skipped.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let builder = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let settings = match builder.build() {
            Ok(settings) => settings,
            Err(err) => {
                if path.exists() {
                    log::warn!(
                        "Failed to load config file {}, falling back to env: {}",
                        path.display(),
                        err
                    );
                }
                Config::builder()
                    .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {}, then env-only error: {}",
                            err, env_err
                        ))
                    })?
            }
        };

        settings.try_deserialize::<AgentConfig>().map_err(|e| {
            ConfigError::Message(format!("Agent configuration could not be loaded: {}", e))
        })
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_seconds.map(Duration::from_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.rate_limit.requests, 100);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(config.lock_timeout(), Duration::from_secs(60));
        assert!(config.statement_timeout().is_none());
        assert!(config.initialize_schema);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "bind_address = \"0.0.0.0:9000\"\nstatement_timeout_seconds = 30\n\n\
             [metadata]\nurl = \"postgres://sg:sg@meta:5432/schemaguard\"\nmax_connections = 3\n\n\
             [rate_limit]\nrequests = 5"
        )
        .unwrap();

        let config = AgentConfig::load_from(&path).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:9000");
        assert_eq!(config.statement_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.metadata.url, "postgres://sg:sg@meta:5432/schemaguard");
        assert_eq!(config.metadata.pool_settings().max_connections, 3);
        assert_eq!(config.rate_limit.requests, 5);
        assert_eq!(config.rate_limit.window_seconds, 60);
        assert_eq!(config.targets.max_connections, 4);
    }
}
