use std::{
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex,
    },
    time::Duration,
};

use flowgate_health::{HealthVerdict, HostHealthMonitor};
use metrics::counter;
use serde::Serialize;
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::warn;

/// Default interval of the starvation canary's tick.
pub const DEFAULT_CANARY_INTERVAL: Duration = Duration::from_millis(100);

/// Default fraction of canary ticks that must go missing before the executor counts as
/// starved.
pub const DEFAULT_CANARY_FAILURE_THRESHOLD: f64 = 0.50;

/// A single throttle signal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleState {
    /// The provider couldn't produce a signal either way.
    Unknown,

    /// Load should be held back.
    Enabled,

    /// No throttling is warranted.
    Disabled,
}

/// A pluggable source of throttle signals.
///
/// The concurrency manager polls every provider on a fixed cadence and combines the results:
/// any `Enabled` activates throttling, and any `Unknown` suppresses parallelism adjustments
/// entirely until the signal clears. A provider that fails to produce a signal should return
/// [`ThrottleState::Unknown`] rather than guessing.
pub trait ThrottleProvider: Send + Sync {
    /// A short name identifying the provider in logs and status reports.
    fn name(&self) -> &'static str;

    /// Computes the provider's current throttle signal.
    fn status(&self) -> ThrottleState;
}

/// A throttle provider driven by host health.
///
/// Maps the health monitor's verdict directly: an overloaded host enables throttling, a
/// healthy host disables it, and an unknown verdict passes through as unknown.
pub struct HostHealthThrottleProvider {
    monitor: Arc<HostHealthMonitor>,
}

impl HostHealthThrottleProvider {
    /// Creates a provider wrapping the given health monitor.
    pub fn new(monitor: Arc<HostHealthMonitor>) -> Self {
        Self { monitor }
    }
}

impl ThrottleProvider for HostHealthThrottleProvider {
    fn name(&self) -> &'static str {
        "host-health"
    }

    fn status(&self) -> ThrottleState {
        match self.monitor.status() {
            HealthVerdict::Ok => ThrottleState::Disabled,
            HealthVerdict::Overloaded => ThrottleState::Enabled,
            HealthVerdict::Unknown => ThrottleState::Unknown,
        }
    }
}

/// A thread-starvation canary.
///
/// The canary schedules a trivial periodic tick onto the shared executor that the host's own
/// work runs on, and counts how many ticks actually fire. If the executor is so saturated that
/// a large fraction of the expected ticks never ran on time, the work queued behind them isn't
/// running either, and the canary reports throttling.
///
/// Each [`status`][ThrottleProvider::status] call evaluates the window since the previous call
/// and resets the count.
pub struct StarvationCanary {
    tick_interval: Duration,
    failure_threshold: f64,
    observed_ticks: Arc<AtomicU64>,
    last_check: Mutex<Instant>,
    ticker: JoinHandle<()>,
}

impl StarvationCanary {
    /// Creates a canary with the default tick interval and failure threshold.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_CANARY_INTERVAL, DEFAULT_CANARY_FAILURE_THRESHOLD)
    }

    /// Creates a canary with an explicit tick interval and failure threshold.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_settings(tick_interval: Duration, failure_threshold: f64) -> Self {
        let observed_ticks = Arc::new(AtomicU64::new(0));
        let ticker_observed = Arc::clone(&observed_ticks);

        let ticker = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + tick_interval, tick_interval);

            // A starved executor must show up as missing ticks, not as a burst of late ones.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                ticker_observed.fetch_add(1, Relaxed);
            }
        });

        Self {
            tick_interval,
            failure_threshold,
            observed_ticks,
            last_check: Mutex::new(Instant::now()),
            ticker,
        }
    }
}

impl Default for StarvationCanary {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleProvider for StarvationCanary {
    fn name(&self) -> &'static str {
        "starvation-canary"
    }

    fn status(&self) -> ThrottleState {
        let now = Instant::now();

        let mut last_check = self.last_check.lock().unwrap();
        let elapsed = now.duration_since(*last_check);
        *last_check = now;
        drop(last_check);

        let observed = self.observed_ticks.swap(0, Relaxed);
        let expected = (elapsed.as_millis() / self.tick_interval.as_millis().max(1)) as u64;
        if expected == 0 {
            return ThrottleState::Disabled;
        }

        let missed = expected.saturating_sub(observed);
        if missed as f64 > expected as f64 * self.failure_threshold {
            warn!(expected, observed, missed, "Starvation canary missed ticks; executor appears saturated.");
            counter!("starvation_canary.trips").increment(1);
            ThrottleState::Enabled
        } else {
            ThrottleState::Disabled
        }
    }
}

impl Drop for StarvationCanary {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}
