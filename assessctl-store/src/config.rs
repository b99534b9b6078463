//! Store configuration
//!
//! Read from `$ASSESSCTL_CONFIG` or `~/.assessctl/config.toml` when present,
//! otherwise defaults. `ASSESSCTL_DATABASE_URL` (then `DATABASE_URL`)
//! overrides the connection string.
//!
//! ```toml
//! database_url = "postgres://localhost/assessctl"
//! max_retries = 3
//!
//! [pool]
//! max_connections = 10
//! acquire_timeout_ms = 5000
//!
//! [transaction]
//! isolation_level = "read_committed"
//! retry_count = 3
//! retry_delay_ms = 100
//! backoff_multiplier = 2.0
//!
//! [retry]
//! retryable_codes = ["55P03"]
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::transaction::{IsolationLevel, TransactionOptions};
use crate::error::{ErrorCode, Result, StoreError};

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/assessctl";

/// Top-level configuration for an `AssessmentStateStore`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
    /// Retry budget that makes a FAILED assessment terminal
    pub max_retries: i32,
    /// Apply embedded migrations before verifying the schema
    pub run_migrations: bool,
    pub pool: PoolConfig,
    pub transaction: TransactionConfig,
    pub retry: RetryTableConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_retries: 3,
            run_migrations: true,
            pool: PoolConfig::default(),
            transaction: TransactionConfig::default(),
            retry: RetryTableConfig::default(),
        }
    }
}

/// Connection pool sizing and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub create_timeout_ms: u64,
    pub destroy_timeout_ms: u64,
    pub reap_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            idle_timeout_ms: 30_000,
            acquire_timeout_ms: 5_000,
            create_timeout_ms: 10_000,
            destroy_timeout_ms: 5_000,
            reap_interval_ms: 1_000,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Defaults applied to every transaction the store runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub isolation_level: IsolationLevel,
    pub timeout_ms: u64,
    /// Additional attempts after the first
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::ReadCommitted,
            timeout_ms: 30_000,
            retry_count: 3,
            retry_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl TransactionConfig {
    pub fn options(&self) -> TransactionOptions {
        TransactionOptions {
            isolation_level: self.isolation_level,
            read_only: false,
            timeout: Duration::from_millis(self.timeout_ms),
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Additions to the built-in retry classification table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryTableConfig {
    /// SQLSTATE codes (or two-character classes) to treat as transient
    pub retryable_codes: Vec<String>,
    /// SQLSTATE codes (or classes) to treat as permanent
    pub permanent_codes: Vec<String>,
    /// Extra message keywords that mark a code-less error as transient
    pub retryable_keywords: Vec<String>,
}

impl StoreConfig {
    /// Load from the config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            Self::from_path(&path)?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Config file path: `$ASSESSCTL_CONFIG` or `~/.assessctl/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = env::var("ASSESSCTL_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".assessctl/config.toml")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            invalid(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| invalid(format!("invalid TOML: {}", e)))
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var("ASSESSCTL_DATABASE_URL").or_else(|_| env::var("DATABASE_URL")) {
            self.database_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(invalid("database_url is empty"));
        }
        if self.max_retries < 0 {
            return Err(invalid("max_retries must be >= 0"));
        }

        let pool = &self.pool;
        if pool.max_connections == 0 {
            return Err(invalid("pool.max_connections must be > 0"));
        }
        if pool.min_connections > pool.max_connections {
            return Err(invalid(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                pool.min_connections, pool.max_connections
            )));
        }
        for (name, value) in [
            ("pool.acquire_timeout_ms", pool.acquire_timeout_ms),
            ("pool.create_timeout_ms", pool.create_timeout_ms),
            ("pool.destroy_timeout_ms", pool.destroy_timeout_ms),
            ("pool.reap_interval_ms", pool.reap_interval_ms),
            ("transaction.timeout_ms", self.transaction.timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(format!("{} must be > 0", name)));
            }
        }

        let tx = &self.transaction;
        if !tx.backoff_multiplier.is_finite() || tx.backoff_multiplier < 1.0 {
            return Err(invalid("transaction.backoff_multiplier must be >= 1.0"));
        }
        if tx.max_delay_ms < tx.retry_delay_ms {
            return Err(invalid(
                "transaction.max_delay_ms must be >= transaction.retry_delay_ms",
            ));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> StoreError {
    StoreError::processing(ErrorCode::InvalidConfig, "load_config", reason)
}
