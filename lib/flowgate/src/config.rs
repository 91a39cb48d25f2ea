use std::time::Duration;

use serde::Deserialize;
use snafu::Snafu;

const fn default_max_degree_of_parallelism() -> usize {
    100
}

const fn default_min_consecutive_increase_limit() -> u32 {
    5
}

const fn default_min_consecutive_decrease_limit() -> u32 {
    3
}

const fn default_min_adjustment_frequency() -> Duration {
    Duration::from_secs(5)
}

const fn default_failed_adjustment_quiet_window() -> Duration {
    Duration::from_secs(30)
}

const fn default_adjustment_run_window() -> Duration {
    Duration::from_secs(10)
}

const fn default_throttle_check_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_sample_history_size() -> usize {
    10
}

const fn default_sample_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_min_sample_count() -> usize {
    5
}

const fn default_max_cpu_threshold() -> f64 {
    0.80
}

const fn default_max_memory_threshold() -> f64 {
    0.90
}

const fn default_canary_interval() -> Duration {
    Duration::from_millis(100)
}

const fn default_canary_failure_threshold() -> f64 {
    0.50
}

/// A configuration error.
#[derive(Debug, Snafu)]
pub enum ConfigurationError {
    /// `max_degree_of_parallelism` was out of range.
    #[snafu(display("'max_degree_of_parallelism' must be at least 1, got {}.", value))]
    InvalidMaxDegreeOfParallelism {
        /// The rejected value.
        value: usize,
    },

    /// A hysteresis limit was out of range.
    #[snafu(display("'{}' must be at least 1.", name))]
    InvalidHysteresisLimit {
        /// Name of the rejected field.
        name: &'static str,
    },

    /// The sampling window doesn't fit the sample history.
    #[snafu(display(
        "'min_sample_count' ({}) must be at least 1 and no larger than 'sample_history_size' ({}).",
        min_sample_count,
        sample_history_size
    ))]
    InvalidSampleWindow {
        /// The configured window size.
        min_sample_count: usize,

        /// The configured history capacity.
        sample_history_size: usize,
    },

    /// A threshold ratio was outside of `(0.0, 1.0]`.
    #[snafu(display("'{}' must be within (0.0, 1.0], got {}.", name, value))]
    InvalidThresholdRatio {
        /// Name of the rejected field.
        name: &'static str,

        /// The rejected value.
        value: f64,
    },
}

/// Dynamic concurrency configuration.
///
/// All fields have defaults, so an empty configuration deserializes to the stock behavior:
/// dynamic concurrency disabled, and conservative scale-up / responsive scale-down once it's
/// turned on.
#[derive(Clone, Debug, Deserialize)]
pub struct ConcurrencyConfiguration {
    /// Whether dynamic concurrency is enabled at all.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub dynamic_concurrency_enabled: bool,

    /// Upper bound on any one function's parallelism.
    ///
    /// Defaults to 100.
    #[serde(default = "default_max_degree_of_parallelism")]
    pub max_degree_of_parallelism: usize,

    /// Number of consecutive healthy throttle polls required before parallelism may grow.
    ///
    /// Defaults to 5.
    #[serde(default = "default_min_consecutive_increase_limit")]
    pub min_consecutive_increase_limit: u32,

    /// Number of consecutive unhealthy throttle polls required before parallelism shrinks.
    ///
    /// Defaults to 3.
    #[serde(default = "default_min_consecutive_decrease_limit")]
    pub min_consecutive_decrease_limit: u32,

    /// Minimum time between two adjustments of the same function.
    ///
    /// Defaults to 5 seconds.
    #[serde(default = "default_min_adjustment_frequency")]
    pub min_adjustment_frequency: Duration,

    /// How long increases stay forbidden after a decrease.
    ///
    /// Defaults to 30 seconds.
    #[serde(default = "default_failed_adjustment_quiet_window")]
    pub failed_adjustment_quiet_window: Duration,

    /// Maximum gap between two same-direction adjustments for them to count as one
    /// accelerating run.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_adjustment_run_window")]
    pub adjustment_run_window: Duration,

    /// How long a throttle evaluation stays fresh before providers are re-polled.
    ///
    /// Defaults to 1 second.
    #[serde(default = "default_throttle_check_interval")]
    pub throttle_check_interval: Duration,

    /// Number of samples retained per process history.
    ///
    /// Defaults to 10.
    #[serde(default = "default_sample_history_size")]
    pub sample_history_size: usize,

    /// Interval between process samples.
    ///
    /// Defaults to 1 second.
    #[serde(default = "default_sample_interval")]
    pub sample_interval: Duration,

    /// Number of recent samples averaged when judging host health.
    ///
    /// Defaults to 5.
    #[serde(default = "default_min_sample_count")]
    pub min_sample_count: usize,

    /// Fraction of total CPU capacity at which the host counts as overloaded.
    ///
    /// Defaults to 0.80.
    #[serde(default = "default_max_cpu_threshold")]
    pub max_cpu_threshold: f64,

    /// Fraction of the plan's memory quota at which the host counts as overloaded.
    ///
    /// Defaults to 0.90.
    #[serde(default = "default_max_memory_threshold")]
    pub max_memory_threshold: f64,

    /// Interval of the thread-starvation canary's tick.
    ///
    /// Defaults to 100 milliseconds.
    #[serde(default = "default_canary_interval")]
    pub canary_interval: Duration,

    /// Fraction of canary ticks that must go missing before the executor counts as starved.
    ///
    /// Defaults to 0.50.
    #[serde(default = "default_canary_failure_threshold")]
    pub canary_failure_threshold: f64,
}

impl ConcurrencyConfiguration {
    /// Creates a configuration with default values.
    pub fn with_defaults() -> Self {
        Self {
            dynamic_concurrency_enabled: false,
            max_degree_of_parallelism: default_max_degree_of_parallelism(),
            min_consecutive_increase_limit: default_min_consecutive_increase_limit(),
            min_consecutive_decrease_limit: default_min_consecutive_decrease_limit(),
            min_adjustment_frequency: default_min_adjustment_frequency(),
            failed_adjustment_quiet_window: default_failed_adjustment_quiet_window(),
            adjustment_run_window: default_adjustment_run_window(),
            throttle_check_interval: default_throttle_check_interval(),
            sample_history_size: default_sample_history_size(),
            sample_interval: default_sample_interval(),
            min_sample_count: default_min_sample_count(),
            max_cpu_threshold: default_max_cpu_threshold(),
            max_memory_threshold: default_max_memory_threshold(),
            canary_interval: default_canary_interval(),
            canary_failure_threshold: default_canary_failure_threshold(),
        }
    }

    /// Validates the configuration.
    ///
    /// ## Errors
    ///
    /// If any field is out of range, an error describing the offending field is returned.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_degree_of_parallelism < 1 {
            return Err(ConfigurationError::InvalidMaxDegreeOfParallelism {
                value: self.max_degree_of_parallelism,
            });
        }

        if self.min_consecutive_increase_limit < 1 {
            return Err(ConfigurationError::InvalidHysteresisLimit {
                name: "min_consecutive_increase_limit",
            });
        }

        if self.min_consecutive_decrease_limit < 1 {
            return Err(ConfigurationError::InvalidHysteresisLimit {
                name: "min_consecutive_decrease_limit",
            });
        }

        if self.min_sample_count < 1 || self.min_sample_count > self.sample_history_size {
            return Err(ConfigurationError::InvalidSampleWindow {
                min_sample_count: self.min_sample_count,
                sample_history_size: self.sample_history_size,
            });
        }

        for (name, value) in [
            ("max_cpu_threshold", self.max_cpu_threshold),
            ("max_memory_threshold", self.max_memory_threshold),
            ("canary_failure_threshold", self.canary_failure_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigurationError::InvalidThresholdRatio { name, value });
            }
        }

        Ok(())
    }
}

impl Default for ConcurrencyConfiguration {
    fn default() -> Self {
        Self::with_defaults()
    }
}
