//! Service configuration loading.

use anyhow::Context;
use jobhost_core::JobHostConfig;
use jobhost_storage::QueueName;
use serde::Deserialize;
use tracing::info;

/// Default configuration file, relative to the working directory, without extension
pub const DEFAULT_CONFIG_FILE: &str = "config/jobhost";

/// Environment variable naming an extra, required configuration file
pub const CONFIG_FILE_ENV: &str = "JOBHOST_CONFIG_FILE";

/// Prefix of environment overrides, e.g. `JOBHOST__HOST__QUEUES__BATCH_SIZE=8`
pub const ENV_PREFIX: &str = "JOBHOST";

/// Everything the service reads from its configuration sources
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub host: JobHostConfig,
    pub demo: DemoSettings,
}

/// The demo function and the queue it listens on
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoSettings {
    pub queue_name: String,
    pub function_name: String,
    /// Run the listener on one host instance at a time
    pub singleton_listener: bool,
    /// Simulated processing time per message
    pub work_ms: u64,
    /// Messages added to the queue at startup
    pub seed_messages: Vec<String>,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            queue_name: "orders".to_string(),
            function_name: "Demo.Orders.Process".to_string(),
            singleton_listener: true,
            work_ms: 250,
            seed_messages: Vec::new(),
        }
    }
}

impl ServiceSettings {
    /// Validate the host configuration and the demo queue name
    pub fn validate(&self) -> anyhow::Result<()> {
        self.host.validate().context("invalid host configuration")?;
        self.queue_name()?;
        Ok(())
    }

    pub fn queue_name(&self) -> anyhow::Result<QueueName> {
        self.demo
            .queue_name
            .parse()
            .with_context(|| format!("invalid demo queue name '{}'", self.demo.queue_name))
    }
}

/// Load settings from, in order of increasing precedence: `default_file`
/// (optional), `explicit_file` (required when given) and `JOBHOST__`
/// environment variables.
///
/// # Errors
///
/// A [`config::ConfigError`] when a file is malformed, a required file is
/// missing or a value has the wrong type.
pub fn load_settings(
    default_file: &str,
    explicit_file: Option<&str>,
) -> Result<ServiceSettings, config::ConfigError> {
    let mut builder = config::Config::builder().add_source(
        config::File::with_name(default_file)
            .required(false)
            .format(config::FileFormat::Yaml),
    );

    if let Some(path) = explicit_file {
        info!(path = %path, "Loading configuration from explicit path");
        builder = builder.add_source(
            config::File::with_name(path)
                .required(true)
                .format(config::FileFormat::Yaml),
        );
    }

    builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
