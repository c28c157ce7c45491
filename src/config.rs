//! Configuration management for Tollgate.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `TOLLGATE__SECTION__KEY` environment variables. The inline `policies`
//! block is read from the file as written, since category names are
//! case-sensitive and the layered loader folds keys to lowercase.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{PolicyRegistry, DEFAULT_BATCH_SIZE};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Expiry sweeper configuration
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Inline policy registry, used when `policies_path` is unset.
    /// Taken verbatim from the config file; not overridable from the environment.
    #[serde(default)]
    pub policies: PolicyRegistry,

    /// Path to a YAML policy registry
    #[serde(default)]
    pub policies_path: Option<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Connection string for the postgres backend
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Deadline for the count query on the request path
    #[serde(default = "default_store_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Deadline for the detached record write
    #[serde(default = "default_store_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Create the schema on start-up
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_url: None,
            max_connections: default_max_connections(),
            query_timeout_ms: default_store_timeout_ms(),
            write_timeout_ms: default_store_timeout_ms(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl StoreConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_max_connections() -> u32 {
    10
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_run_migrations() -> bool {
    true
}

/// Expiry sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Records deleted per atomic batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Run the sweeper in-process at this interval; unset leaves
    /// scheduling to an external scheduler invoking `tollgate sweep`
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            interval_secs: None,
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The subset of the config file that must keep its key case.
#[derive(Debug, Deserialize)]
struct PolicySection {
    #[serde(default)]
    policies: Option<PolicyRegistry>,
}

/// Re-read the `policies` block straight from the file so category names
/// keep the case they were declared with.
fn inline_policies(path: &Path) -> Result<Option<PolicyRegistry>> {
    let contents = std::fs::read_to_string(path)?;
    let section: PolicySection = serde_yaml::from_str(&contents).map_err(|e| {
        TollgateError::Config(format!(
            "Failed to parse policies in {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(section.policies)
}

impl TollgateConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TOLLGATE")
                .prefix_separator("__")
                .separator("__"),
        );

        let mut config: TollgateConfig = builder.build()?.try_deserialize()?;
        if let Some(path) = path {
            if let Some(policies) = inline_policies(path)? {
                config.policies = policies;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// The policy registry to run with: the external file if one is
    /// configured, otherwise the inline registry.
    pub fn policy_registry(&self) -> Result<PolicyRegistry> {
        match &self.policies_path {
            Some(path) => PolicyRegistry::from_file(path),
            None => Ok(self.policies.clone()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.policies.validate()?;
        if self.sweeper.batch_size == 0 {
            return Err(TollgateError::Config(
                "sweeper.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.sweeper.interval_secs == Some(0) {
            return Err(TollgateError::Config(
                "sweeper.interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
