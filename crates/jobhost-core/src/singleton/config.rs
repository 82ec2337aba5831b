//! Singleton lock timing configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest lease the lock store accepts
pub const MINIMUM_LEASE_PERIOD: Duration = Duration::from_secs(15);

/// Longest lease the lock store accepts
pub const MAXIMUM_LEASE_PERIOD: Duration = Duration::from_secs(60);

/// Shortest interval between acquisition attempts
pub const MINIMUM_POLLING_INTERVAL: Duration = Duration::from_millis(500);

/// Validated singleton timing settings.
///
/// Setters reject out-of-range values. A `None` listener recovery interval
/// disables recovery: a listener that fails to get its lock at startup
/// stays idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingletonConfig {
    lock_period: Duration,
    listener_lock_period: Duration,
    lock_acquisition_timeout: Duration,
    lock_acquisition_polling_interval: Duration,
    listener_lock_recovery_polling_interval: Option<Duration>,
}

impl Default for SingletonConfig {
    fn default() -> Self {
        Self {
            lock_period: Duration::from_secs(15),
            listener_lock_period: Duration::from_secs(60),
            lock_acquisition_timeout: Duration::from_secs(60),
            lock_acquisition_polling_interval: Duration::from_secs(1),
            listener_lock_recovery_polling_interval: Some(Duration::from_secs(60)),
        }
    }
}

fn validate_lease_period(field: &str, value: Duration) -> Result<(), ConfigurationError> {
    if value < MINIMUM_LEASE_PERIOD || value > MAXIMUM_LEASE_PERIOD {
        return Err(ConfigurationError::out_of_range(
            field,
            format!(
                "{:?} must be between {:?} and {:?}",
                value, MINIMUM_LEASE_PERIOD, MAXIMUM_LEASE_PERIOD
            ),
        ));
    }

    Ok(())
}

impl SingletonConfig {
    /// Build a configuration without range checks.
    ///
    /// Lets tests run locks with sub-second periods.
    #[doc(hidden)]
    pub fn unchecked(
        lock_period: Duration,
        listener_lock_period: Duration,
        lock_acquisition_timeout: Duration,
        lock_acquisition_polling_interval: Duration,
        listener_lock_recovery_polling_interval: Option<Duration>,
    ) -> Self {
        Self {
            lock_period,
            listener_lock_period,
            lock_acquisition_timeout,
            lock_acquisition_polling_interval,
            listener_lock_recovery_polling_interval,
        }
    }

    /// Lease period for function-mode locks
    pub fn lock_period(&self) -> Duration {
        self.lock_period
    }

    pub fn set_lock_period(&mut self, value: Duration) -> Result<(), ConfigurationError> {
        validate_lease_period("lock_period", value)?;
        self.lock_period = value;
        Ok(())
    }

    /// Lease period for listener-mode locks
    pub fn listener_lock_period(&self) -> Duration {
        self.listener_lock_period
    }

    pub fn set_listener_lock_period(&mut self, value: Duration) -> Result<(), ConfigurationError> {
        validate_lease_period("listener_lock_period", value)?;
        self.listener_lock_period = value;
        Ok(())
    }

    /// How long a blocking acquisition keeps retrying
    pub fn lock_acquisition_timeout(&self) -> Duration {
        self.lock_acquisition_timeout
    }

    pub fn set_lock_acquisition_timeout(&mut self, value: Duration) {
        self.lock_acquisition_timeout = value;
    }

    /// Delay between acquisition attempts
    pub fn lock_acquisition_polling_interval(&self) -> Duration {
        self.lock_acquisition_polling_interval
    }

    pub fn set_lock_acquisition_polling_interval(
        &mut self,
        value: Duration,
    ) -> Result<(), ConfigurationError> {
        if value < MINIMUM_POLLING_INTERVAL {
            return Err(ConfigurationError::out_of_range(
                "lock_acquisition_polling_interval",
                format!("{:?} must be at least {:?}", value, MINIMUM_POLLING_INTERVAL),
            ));
        }

        self.lock_acquisition_polling_interval = value;
        Ok(())
    }

    /// Interval at which an idle singleton listener retries its lock
    pub fn listener_lock_recovery_polling_interval(&self) -> Option<Duration> {
        self.listener_lock_recovery_polling_interval
    }

    pub fn set_listener_lock_recovery_polling_interval(
        &mut self,
        value: Option<Duration>,
    ) -> Result<(), ConfigurationError> {
        if let Some(interval) = value {
            if interval < MINIMUM_LEASE_PERIOD {
                return Err(ConfigurationError::out_of_range(
                    "listener_lock_recovery_polling_interval",
                    format!(
                        "{:?} must be at least {:?} or infinite",
                        interval, MINIMUM_LEASE_PERIOD
                    ),
                ));
            }
        }

        self.listener_lock_recovery_polling_interval = value;
        Ok(())
    }
}

/// Serialized form of [`SingletonConfig`] as read from configuration files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingletonSettings {
    pub lock_period_secs: u64,
    pub listener_lock_period_secs: u64,
    pub lock_acquisition_timeout_secs: u64,
    pub lock_acquisition_polling_interval_ms: u64,
    /// `None` (YAML `~`) disables listener lock recovery
    pub listener_lock_recovery_polling_interval_secs: Option<u64>,
}

impl Default for SingletonSettings {
    fn default() -> Self {
        Self {
            lock_period_secs: 15,
            listener_lock_period_secs: 60,
            lock_acquisition_timeout_secs: 60,
            lock_acquisition_polling_interval_ms: 1000,
            listener_lock_recovery_polling_interval_secs: Some(60),
        }
    }
}

impl TryFrom<&SingletonSettings> for SingletonConfig {
    type Error = ConfigurationError;

    fn try_from(settings: &SingletonSettings) -> Result<Self, Self::Error> {
        let mut config = SingletonConfig::default();
        config.set_lock_period(Duration::from_secs(settings.lock_period_secs))?;
        config.set_listener_lock_period(Duration::from_secs(settings.listener_lock_period_secs))?;
        config.set_lock_acquisition_timeout(Duration::from_secs(
            settings.lock_acquisition_timeout_secs,
        ));
        config.set_lock_acquisition_polling_interval(Duration::from_millis(
            settings.lock_acquisition_polling_interval_ms,
        ))?;
        config.set_listener_lock_recovery_polling_interval(
            settings
                .listener_lock_recovery_polling_interval_secs
                .map(Duration::from_secs),
        )?;
        Ok(config)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
