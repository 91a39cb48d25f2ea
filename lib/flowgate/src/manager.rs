use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex,
    },
};

use flowgate_env::ComputePlan;
use flowgate_health::{HostHealthMonitor, HostHealthSettings};
use metrics::gauge;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{
    config::{ConcurrencyConfiguration, ConfigurationError},
    function::{AdjustmentLimits, ConcurrencySnapshot, FunctionConcurrency},
    throttle::{HostHealthThrottleProvider, StarvationCanary, ThrottleProvider, ThrottleState},
};

/// One provider's contribution to the last throttle evaluation.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ProviderReading {
    /// The provider's name.
    pub provider: &'static str,

    /// The signal it reported.
    pub state: ThrottleState,
}

/// An on-demand report of the manager's current state.
#[derive(Debug, Serialize)]
pub struct ManagerSnapshot {
    /// Whether throttling is currently active.
    pub throttle_enabled: bool,

    /// The most recent reading from each provider.
    pub providers: Vec<ProviderReading>,

    /// Every known function's concurrency state.
    pub functions: BTreeMap<String, ConcurrencySnapshot>,
}

#[derive(Debug)]
struct ThrottleCache {
    last_check: Option<Instant>,
    last_readings: Vec<ProviderReading>,
    any_unknown: bool,
    consecutive_healthy: u32,
    consecutive_unhealthy: u32,
}

/// The dynamic concurrency manager.
///
/// One instance serves an entire host. Listener loops call
/// [`get_status`][Self::get_status] for their function id to learn how much new work to fetch,
/// and report invocations through [`function_started`][Self::function_started] /
/// [`function_completed`][Self::function_completed]. The manager polls its throttle providers
/// on a fixed cadence, tracks consecutive healthy/unhealthy evaluations, and nudges each
/// function's parallelism up under sustained health or down under sustained pressure.
///
/// `get_status` must not be called concurrently for the same function id: each listener owns
/// its loop. Calls for different ids are free to race.
pub struct ConcurrencyManager {
    config: ConcurrencyConfiguration,
    providers: Vec<Box<dyn ThrottleProvider>>,
    host_health: Option<Arc<HostHealthMonitor>>,
    functions: papaya::HashMap<String, Arc<FunctionConcurrency>>,
    throttled: Arc<AtomicBool>,
    throttle_cache: Mutex<ThrottleCache>,
}

impl ConcurrencyManager {
    /// Creates a manager over the given throttle providers.
    ///
    /// ## Errors
    ///
    /// If the configuration fails validation, an error is returned.
    pub fn new(
        config: ConcurrencyConfiguration, providers: Vec<Box<dyn ThrottleProvider>>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;

        Ok(Self {
            config,
            providers,
            host_health: None,
            functions: papaya::HashMap::new(),
            throttled: Arc::new(AtomicBool::new(false)),
            throttle_cache: Mutex::new(ThrottleCache {
                last_check: None,
                last_readings: Vec::new(),
                any_unknown: false,
                consecutive_healthy: 0,
                consecutive_unhealthy: 0,
            }),
        })
    }

    /// Creates a manager with the built-in providers: host health and the starvation canary.
    ///
    /// The host health monitor is constructed from the given plan and this configuration's
    /// sampling settings, and remains reachable through
    /// [`host_health`][Self::host_health] so the host can register child processes.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// ## Errors
    ///
    /// If the configuration fails validation, an error is returned.
    pub fn with_default_providers(
        config: ConcurrencyConfiguration, plan: &ComputePlan,
    ) -> Result<Self, ConfigurationError> {
        let monitor = Arc::new(HostHealthMonitor::with_settings(
            plan,
            HostHealthSettings {
                sample_interval: config.sample_interval,
                sample_history_size: config.sample_history_size,
                min_sample_count: config.min_sample_count,
                max_cpu_threshold: config.max_cpu_threshold,
                max_memory_threshold: config.max_memory_threshold,
            },
        ));

        let providers: Vec<Box<dyn ThrottleProvider>> = vec![
            Box::new(HostHealthThrottleProvider::new(Arc::clone(&monitor))),
            Box::new(StarvationCanary::with_settings(
                config.canary_interval,
                config.canary_failure_threshold,
            )),
        ];

        let mut manager = Self::new(config, providers)?;
        manager.host_health = Some(monitor);
        Ok(manager)
    }

    /// Whether dynamic concurrency is enabled in the configuration.
    pub fn enabled(&self) -> bool {
        self.config.dynamic_concurrency_enabled
    }

    /// The host health monitor, when the manager owns one.
    pub fn host_health(&self) -> Option<&Arc<HostHealthMonitor>> {
        self.host_health.as_ref()
    }

    /// Whether throttling is currently active.
    ///
    /// If the last provider evaluation has gone stale, every provider is re-polled first.
    pub fn is_throttle_enabled(&self) -> bool {
        let now = Instant::now();
        let stale = {
            let cache = self.throttle_cache.lock().unwrap();
            cache
                .last_check
                .map_or(true, |last| now.duration_since(last) > self.config.throttle_check_interval)
        };

        if stale {
            self.update_throttle_state(now);
        }

        self.throttled.load(Relaxed)
    }

    fn update_throttle_state(&self, now: Instant) {
        let readings = self
            .providers
            .iter()
            .map(|provider| {
                // A provider failure is a missing signal, never a reason to tear down the
                // host's work loop.
                let state = catch_unwind(AssertUnwindSafe(|| provider.status())).unwrap_or_else(|_| {
                    warn!(provider = provider.name(), "Throttle provider panicked; treating as unknown.");
                    ThrottleState::Unknown
                });

                ProviderReading {
                    provider: provider.name(),
                    state,
                }
            })
            .collect::<Vec<_>>();

        let any_enabled = readings.iter().any(|reading| reading.state == ThrottleState::Enabled);
        let any_unknown = readings.iter().any(|reading| reading.state == ThrottleState::Unknown);

        let mut cache = self.throttle_cache.lock().unwrap();
        if any_enabled {
            cache.consecutive_unhealthy += 1;
            cache.consecutive_healthy = 0;
        } else {
            cache.consecutive_healthy += 1;
            cache.consecutive_unhealthy = 0;
        }
        cache.any_unknown = any_unknown;
        cache.last_readings = readings;
        cache.last_check = Some(now);
        drop(cache);

        self.throttled.store(any_enabled, Relaxed);
        gauge!("concurrency.throttle_enabled").set(if any_enabled { 1.0 } else { 0.0 });
    }

    /// Computes the current concurrency status for a function, adjusting its parallelism when
    /// the adjustment and hysteresis gates allow.
    ///
    /// The returned snapshot carries the fetch count the listener asked for. Must not be
    /// called concurrently for the same function id.
    pub fn get_status(&self, function_id: &str) -> ConcurrencySnapshot {
        let status = self.function_status(function_id);

        let now = Instant::now();
        if status.can_adjust(now) {
            let throttle_enabled = self.is_throttle_enabled();
            let (any_unknown, healthy, unhealthy) = {
                let cache = self.throttle_cache.lock().unwrap();
                (cache.any_unknown, cache.consecutive_healthy, cache.consecutive_unhealthy)
            };

            // An unknown signal means we can't tell which way to move, so we hold steady and
            // keep serving at the current parallelism.
            if !any_unknown {
                if !throttle_enabled
                    && healthy >= self.config.min_consecutive_increase_limit
                    && status.can_increase(now)
                {
                    let raised = status.increase(now);
                    debug!(
                        function_id,
                        current_parallelism = raised,
                        outstanding_invocations = status.outstanding_invocations(),
                        "Increased function parallelism."
                    );
                    gauge!("concurrency.function_parallelism", "function_id" => function_id.to_string())
                        .set(raised as f64);
                } else if throttle_enabled
                    && unhealthy >= self.config.min_consecutive_decrease_limit
                    && status.can_decrease()
                {
                    let lowered = status.decrease(now);
                    debug!(
                        function_id,
                        current_parallelism = lowered,
                        outstanding_invocations = status.outstanding_invocations(),
                        "Decreased function parallelism."
                    );
                    gauge!("concurrency.function_parallelism", "function_id" => function_id.to_string())
                        .set(lowered as f64);
                }
            }
        }

        let snapshot = status.snapshot();
        trace!(function_id, ?snapshot, "Computed function concurrency status.");
        snapshot
    }

    /// Records the start of an invocation of the given function.
    pub fn function_started(&self, function_id: &str) {
        self.function_status(function_id).function_started();
    }

    /// Records the completion of an invocation of the given function.
    pub fn function_completed(&self, function_id: &str) {
        self.function_status(function_id).function_completed();
    }

    /// Produces a serializable report of all function statuses and throttle signals.
    pub fn snapshot(&self) -> ManagerSnapshot {
        let (throttle_enabled, providers) = {
            let cache = self.throttle_cache.lock().unwrap();
            (self.throttled.load(Relaxed), cache.last_readings.clone())
        };

        let functions = self
            .functions
            .pin()
            .iter()
            .map(|(id, status)| (id.clone(), status.snapshot()))
            .collect();

        ManagerSnapshot {
            throttle_enabled,
            providers,
            functions,
        }
    }

    fn function_status(&self, function_id: &str) -> Arc<FunctionConcurrency> {
        let functions = self.functions.pin();
        if let Some(status) = functions.get(function_id) {
            return Arc::clone(status);
        }

        let limits = AdjustmentLimits {
            max_parallelism: self.config.max_degree_of_parallelism,
            adjustment_frequency: self.config.min_adjustment_frequency,
            quiet_window: self.config.failed_adjustment_quiet_window,
            run_window: self.config.adjustment_run_window,
        };

        let status = functions.get_or_insert_with(function_id.to_string(), || {
            Arc::new(FunctionConcurrency::new(limits, Arc::clone(&self.throttled)))
        });
        Arc::clone(status)
    }
}
