//! Delay strategies deciding how long a timer waits before its next run.

use crate::error::ConfigurationError;
use rand::Rng;
use std::time::Duration;

/// Fraction by which the randomized backoff delta may vary either way
const RANDOMIZATION_FACTOR: f64 = 0.2;

/// Computes the next wait from whether the last execution succeeded
pub trait DelayStrategy: Send {
    /// Report the outcome of the last execution and get the next delay
    fn get_next_delay(&mut self, execution_succeeded: bool) -> Duration;
}

// ============================================================================
// Randomized exponential backoff
// ============================================================================

/// Polling backoff used by queue listeners.
///
/// Success resets the delay to the minimum. Each failure adds a randomized
/// increment of `delta * 2^(n-1)` (with `delta` varied by ±20%) to the
/// minimum until the maximum is reached, after which the maximum is
/// returned. Consecutive failures never shrink the delay.
#[derive(Debug, Clone)]
pub struct RandomizedExponentialBackoffStrategy {
    minimum_interval: Duration,
    maximum_interval: Duration,
    delta_backoff: Duration,
    current_interval: Duration,
    backoff_exponent: u32,
}

impl RandomizedExponentialBackoffStrategy {
    /// Create a strategy whose delta equals the minimum interval.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::OutOfRange`] when `minimum_interval`
    /// exceeds `maximum_interval`.
    pub fn new(
        minimum_interval: Duration,
        maximum_interval: Duration,
    ) -> Result<Self, ConfigurationError> {
        Self::with_delta(minimum_interval, maximum_interval, minimum_interval)
    }

    /// Create a strategy with an explicit backoff delta
    pub fn with_delta(
        minimum_interval: Duration,
        maximum_interval: Duration,
        delta_backoff: Duration,
    ) -> Result<Self, ConfigurationError> {
        if minimum_interval > maximum_interval {
            return Err(ConfigurationError::out_of_range(
                "minimum_interval",
                format!(
                    "{:?} must not be greater than the maximum interval {:?}",
                    minimum_interval, maximum_interval
                ),
            ));
        }

        Ok(Self {
            minimum_interval,
            maximum_interval,
            delta_backoff,
            current_interval: minimum_interval,
            backoff_exponent: 0,
        })
    }

    /// Delay most recently returned
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    fn randomized_increment(&self) -> Duration {
        let delta_ms = self.delta_backoff.as_secs_f64() * 1000.0;
        let low = delta_ms * (1.0 - RANDOMIZATION_FACTOR);
        let high = delta_ms * (1.0 + RANDOMIZATION_FACTOR);
        let randomized = if high > low {
            rand::thread_rng().gen_range(low..=high)
        } else {
            delta_ms
        };

        let factor = 2f64.powi(self.backoff_exponent.saturating_sub(1) as i32);
        Duration::from_secs_f64((randomized * factor).min(f64::from(u32::MAX)) / 1000.0)
    }
}

impl DelayStrategy for RandomizedExponentialBackoffStrategy {
    fn get_next_delay(&mut self, execution_succeeded: bool) -> Duration {
        if execution_succeeded {
            self.current_interval = self.minimum_interval;
            self.backoff_exponent = 1;
        } else if self.current_interval != self.maximum_interval {
            let mut backoff_interval = self.minimum_interval;
            if self.backoff_exponent > 0 {
                backoff_interval += self.randomized_increment();
            }

            if backoff_interval < self.maximum_interval {
                self.current_interval = backoff_interval;
                self.backoff_exponent += 1;
            } else {
                self.current_interval = self.maximum_interval;
            }
        }

        self.current_interval
    }
}

// ============================================================================
// Linear speed-up
// ============================================================================

/// Renewal cadence used for leases and message visibility.
///
/// Success returns the normal interval. Each failure divides the current
/// interval by the divisor, never going below the minimum, so that a
/// struggling renewal retries sooner while there is still time left.
#[derive(Debug, Clone)]
pub struct LinearSpeedupStrategy {
    normal_interval: Duration,
    minimum_interval: Duration,
    failure_speedup_divisor: u32,
    current_interval: Duration,
}

impl LinearSpeedupStrategy {
    /// Divisor applied on each failure unless configured otherwise
    pub const DEFAULT_SPEEDUP_DIVISOR: u32 = 2;

    /// Create a strategy halving the interval on failure
    pub fn new(
        normal_interval: Duration,
        minimum_interval: Duration,
    ) -> Result<Self, ConfigurationError> {
        Self::with_divisor(
            normal_interval,
            minimum_interval,
            Self::DEFAULT_SPEEDUP_DIVISOR,
        )
    }

    /// Create a strategy with an explicit failure divisor
    pub fn with_divisor(
        normal_interval: Duration,
        minimum_interval: Duration,
        failure_speedup_divisor: u32,
    ) -> Result<Self, ConfigurationError> {
        if minimum_interval > normal_interval {
            return Err(ConfigurationError::out_of_range(
                "minimum_interval",
                format!(
                    "{:?} must not be greater than the normal interval {:?}",
                    minimum_interval, normal_interval
                ),
            ));
        }

        if failure_speedup_divisor < 1 {
            return Err(ConfigurationError::out_of_range(
                "failure_speedup_divisor",
                "must be at least 1",
            ));
        }

        Ok(Self {
            normal_interval,
            minimum_interval,
            failure_speedup_divisor,
            current_interval: normal_interval,
        })
    }
}

impl DelayStrategy for LinearSpeedupStrategy {
    fn get_next_delay(&mut self, execution_succeeded: bool) -> Duration {
        if execution_succeeded {
            self.current_interval = self.normal_interval;
        } else {
            let sped_up = self.current_interval / self.failure_speedup_divisor;
            self.current_interval = sped_up.max(self.minimum_interval);
        }

        self.current_interval
    }
}

// ============================================================================
// Fixed delay
// ============================================================================

/// Always waits the same interval
#[derive(Debug, Clone, Copy)]
pub struct FixedDelayStrategy {
    interval: Duration,
}

impl FixedDelayStrategy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl DelayStrategy for FixedDelayStrategy {
    fn get_next_delay(&mut self, _execution_succeeded: bool) -> Duration {
        self.interval
    }
}

#[cfg(test)]
#[path = "delay_tests.rs"]
mod tests;
