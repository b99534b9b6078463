//! Command implementations for assessctl

pub mod assessments;
pub mod db;

use anyhow::{Context as _, Result};
use assessctl_store::{AssessmentStateStore, StoreConfig};

/// Settings shared by every command
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub database_url: Option<String>,
}

impl Context {
    /// Load configuration, applying the command-line override last.
    pub fn config(&self) -> Result<StoreConfig> {
        let mut config = StoreConfig::load().context("Failed to load store configuration")?;
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        Ok(config)
    }

    pub async fn open_store(&self) -> Result<AssessmentStateStore> {
        let config = self.config()?;
        tracing::debug!(
            max_connections = config.pool.max_connections,
            "opening assessment store"
        );
        AssessmentStateStore::open(config)
            .await
            .context("Failed to open assessment store")
    }
}
