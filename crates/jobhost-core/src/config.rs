//! Host-level configuration.
//!
//! [`JobHostConfig`] is what the service deserializes from its configuration
//! sources. Every field has a default, so an empty file is valid.

use crate::error::ConfigurationError;
use crate::locks::FixedHostIdProvider;
use crate::queues::QueuesConfig;
use crate::singleton::{SingletonConfig, SingletonSettings};
use jobhost_storage::DEFAULT_STORAGE_ACCOUNT;
use serde::{Deserialize, Serialize};

/// Configuration for one job host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobHostConfig {
    /// Shared by every instance of the same logical host; generated when absent
    pub host_id: Option<String>,

    /// Account holding the queues and lock blobs
    pub storage_account: String,

    pub queues: QueuesConfig,

    pub singleton: SingletonSettings,
}

impl Default for JobHostConfig {
    fn default() -> Self {
        Self {
            host_id: None,
            storage_account: DEFAULT_STORAGE_ACCOUNT.to_string(),
            queues: QueuesConfig::default(),
            singleton: SingletonSettings::default(),
        }
    }
}

impl JobHostConfig {
    /// Check every section.
    ///
    /// # Errors
    ///
    /// The first [`ConfigurationError`] found.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some(host_id) = &self.host_id {
            FixedHostIdProvider::new(host_id.as_str())?;
        }

        if self.storage_account.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "storage_account".to_string(),
            });
        }

        self.queues.validate()?;
        self.singleton_config()?;
        Ok(())
    }

    /// Singleton settings converted to their validated form
    pub fn singleton_config(&self) -> Result<SingletonConfig, ConfigurationError> {
        SingletonConfig::try_from(&self.singleton)
    }

    /// Host id provider for the configured id, or a generated one
    pub fn host_id_provider(&self) -> Result<FixedHostIdProvider, ConfigurationError> {
        match &self.host_id {
            Some(host_id) => FixedHostIdProvider::new(host_id.as_str()),
            None => Ok(FixedHostIdProvider::generated()),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
