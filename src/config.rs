//! Run configuration, read from `lakebench.toml`.
//!
//! ```toml
//! concurrency_level = 40
//! run_timeout_secs = 300
//!
//! [target]
//! host = "instance.database.example.com"
//! database = "postgres"
//! user = "bench@example.com"
//! password_env = "PGPASSWORD"
//! ssl_mode = "require"
//!
//! [pool]
//! acquire_timeout_secs = 10
//! recycle_interval_secs = 3600
//! pre_validate = true
//!
//! [queries]
//! paths = ["queries/"]
//!
//! [pgbench]
//! clients = 8
//! jobs = 4
//! duration_secs = 30
//! protocol = "prepared"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BenchError, BenchResult};
use crate::parser::{UploadPolicy, DEFAULT_MAX_UPLOAD_BYTES};
use crate::pgbench::PgbenchSettings;
use crate::pool::{PoolConfig, SslMode};

/// File name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "lakebench.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub target: TargetConfig,
    pub concurrency_level: usize,
    /// Stop admitting new executions after this long.
    pub run_timeout_secs: Option<u64>,
    /// Abandon any single statement after this long.
    pub statement_timeout_secs: Option<u64>,
    pub pool: PoolSettings,
    pub queries: QuerySources,
    pub pgbench: PgbenchSettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            concurrency_level: 10,
            run_timeout_secs: None,
            statement_timeout_secs: Some(30),
            pool: PoolSettings::default(),
            queries: QuerySources::default(),
            pgbench: PgbenchSettings::default(),
        }
    }
}

/// Connection parameters for the database under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Name of the environment variable holding the password or token.
    pub password_env: Option<String>,
    pub ssl_mode: SslMode,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password_env: None,
            ssl_mode: SslMode::Require,
        }
    }
}

impl TargetConfig {
    /// Resolve the credentials reference.
    pub fn password(&self) -> BenchResult<Option<String>> {
        match &self.password_env {
            None => Ok(None),
            Some(var) => std::env::var(var).map(Some).map_err(|_| {
                BenchError::Config(format!("password environment variable '{}' is not set", var))
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Defaults to `max(1, concurrency_level / 4)`.
    pub base_size: Option<usize>,
    /// Defaults to `concurrency_level`.
    pub max_overflow: Option<usize>,
    pub acquire_timeout_secs: u64,
    pub recycle_interval_secs: u64,
    pub pre_validate: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            base_size: None,
            max_overflow: None,
            acquire_timeout_secs: 10,
            recycle_interval_secs: 3600,
            pre_validate: false,
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self, concurrency_level: usize, ssl_mode: SslMode) -> PoolConfig {
        let defaults = PoolConfig::for_concurrency(concurrency_level);
        PoolConfig::for_concurrency(concurrency_level)
            .base_size(self.base_size.unwrap_or(defaults.base_size))
            .max_overflow(self.max_overflow.unwrap_or(defaults.max_overflow))
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
            .idle_recycle_interval(Duration::from_secs(self.recycle_interval_secs))
            .pre_validate(self.pre_validate)
            .ssl_mode(ssl_mode)
    }
}

/// Where query definitions come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySources {
    /// Files or directories of annotated `.sql` uploads.
    pub paths: Vec<PathBuf>,
    pub allowed_extensions: Vec<String>,
    pub max_upload_bytes: usize,
}

impl Default for QuerySources {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            allowed_extensions: vec!["sql".to_string()],
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl QuerySources {
    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            allowed_extensions: self.allowed_extensions.clone(),
            max_bytes: self.max_upload_bytes,
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(content: &str) -> BenchResult<Self> {
        toml::from_str(content).map_err(|e| BenchError::Config(e.to_string()))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Otherwise `./lakebench.toml` is tried,
    /// then `<config dir>/lakebench/config.toml`, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> BenchResult<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        for candidate in default_locations() {
            if candidate.exists() {
                return Self::from_file(&candidate);
            }
        }
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    fn from_file(path: &Path) -> BenchResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BenchError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> BenchResult<()> {
        if self.concurrency_level == 0 {
            return Err(BenchError::Config("concurrency_level must be at least 1".into()));
        }
        if self.pool.acquire_timeout_secs == 0 {
            return Err(BenchError::Config("pool.acquire_timeout_secs must be at least 1".into()));
        }
        if self.pool_config().capacity() == 0 {
            return Err(BenchError::Config(
                "pool.base_size + pool.max_overflow must be at least 1".into(),
            ));
        }
        self.pgbench.validate()
    }

    pub fn pool_config(&self) -> PoolConfig {
        self.pool
            .to_pool_config(self.concurrency_level, self.target.ssl_mode)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_secs.map(Duration::from_secs)
    }
}

fn default_locations() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("lakebench").join("config.toml"));
    }
    paths
}
