//! Host process health monitoring.
//!
//! `HostHealthMonitor` watches the host process, and any registered child processes, for
//! sustained CPU and memory pressure. Each process gets its own [`ProcessMonitor`] sampling
//! into bounded histories; on demand, the monitor averages the most recent samples of every
//! process, sums them into a single process-tree aggregate, and compares the aggregate against
//! the configured thresholds to produce a [`HealthVerdict`].
//!
//! Memory is only evaluated on metered plans, where the plan publishes a byte budget worth
//! defending. On unmetered plans the machine's memory is nobody's business but the kernel's,
//! and only CPU is considered.

use std::{sync::Mutex, time::Duration};

use flowgate_env::ComputePlan;
use metrics::gauge;
use process_stats::{querier_for_pid, ProcessMonitor, ProcessStats};
use tracing::{debug, warn};

/// Default number of recent samples averaged per process.
pub const DEFAULT_MIN_SAMPLE_COUNT: usize = 5;

/// Default fraction of total CPU capacity considered overloaded.
pub const DEFAULT_MAX_CPU_THRESHOLD: f64 = 0.80;

/// Default fraction of the plan's memory quota considered overloaded.
pub const DEFAULT_MAX_MEMORY_THRESHOLD: f64 = 0.90;

/// The health of the host process tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthVerdict {
    /// Not enough signal to judge either way.
    Unknown,

    /// The host is healthy.
    Ok,

    /// At least one monitored metric is over its threshold.
    Overloaded,
}

impl HealthVerdict {
    /// Combines multiple verdicts into one.
    ///
    /// If every verdict is `Unknown` (or there are none), the result is `Unknown`; otherwise,
    /// any `Overloaded` makes the result `Overloaded`, and the result is `Ok` only when at
    /// least one contributor affirmatively said so.
    pub fn combine<I>(verdicts: I) -> HealthVerdict
    where
        I: IntoIterator<Item = HealthVerdict>,
    {
        let mut combined = HealthVerdict::Unknown;
        for verdict in verdicts {
            match verdict {
                HealthVerdict::Overloaded => return HealthVerdict::Overloaded,
                HealthVerdict::Ok => combined = HealthVerdict::Ok,
                HealthVerdict::Unknown => {}
            }
        }

        combined
    }
}

/// Settings for a [`HostHealthMonitor`].
#[derive(Clone, Copy, Debug)]
pub struct HostHealthSettings {
    /// Interval between samples of each monitored process.
    pub sample_interval: Duration,

    /// Number of samples retained per history.
    pub sample_history_size: usize,

    /// Number of recent samples a process must have before it contributes to the aggregate,
    /// and the size of the window that gets averaged.
    pub min_sample_count: usize,

    /// Fraction of total CPU capacity at which the host counts as overloaded.
    pub max_cpu_threshold: f64,

    /// Fraction of the plan's memory quota at which the host counts as overloaded.
    pub max_memory_threshold: f64,
}

impl Default for HostHealthSettings {
    fn default() -> Self {
        Self {
            sample_interval: process_stats::DEFAULT_SAMPLE_INTERVAL,
            sample_history_size: process_stats::DEFAULT_SAMPLE_HISTORY_SIZE,
            min_sample_count: DEFAULT_MIN_SAMPLE_COUNT,
            max_cpu_threshold: DEFAULT_MAX_CPU_THRESHOLD,
            max_memory_threshold: DEFAULT_MAX_MEMORY_THRESHOLD,
        }
    }
}

/// Monitors the health of the host process and its registered children.
///
/// The monitor for the host process is created and started at construction. Child monitors are
/// created on [`register`][Self::register] and owned by the health monitor until
/// [`unregister`][Self::unregister] reclaims and stops them; all monitors are stopped when the
/// health monitor is dropped.
pub struct HostHealthMonitor {
    host: ProcessMonitor,
    children: Mutex<Vec<ProcessMonitor>>,
    settings: HostHealthSettings,
    effective_cores: usize,
    cpu_threshold_percent: f64,
    memory_threshold_bytes: Option<f64>,
}

impl HostHealthMonitor {
    /// Creates a monitor for the current process on the given plan, with default settings.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(plan: &ComputePlan) -> Self {
        Self::with_settings(plan, HostHealthSettings::default())
    }

    /// Creates a monitor for the current process on the given plan.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_settings(plan: &ComputePlan, settings: HostHealthSettings) -> Self {
        let pid = std::process::id();
        let host = ProcessMonitor::with_settings(
            pid,
            querier_for_pid(pid),
            plan.effective_cores(),
            settings.sample_interval,
            settings.sample_history_size,
        );

        Self::from_host_monitor(host, plan, settings)
    }

    /// Creates a monitor around an existing host-process monitor.
    ///
    /// The monitor is started if it hasn't been already.
    pub fn from_host_monitor(host: ProcessMonitor, plan: &ComputePlan, settings: HostHealthSettings) -> Self {
        host.start();

        // CPU samples are already normalized to the plan's effective cores by the monitors, so
        // the aggregate is judged against a flat percentage. Memory is only judged on metered
        // plans.
        let effective_cores = plan.effective_cores();
        let cpu_threshold_percent = settings.max_cpu_threshold * 100.0;
        let memory_threshold_bytes = plan
            .memory_quota_bytes()
            .map(|quota| quota as f64 * settings.max_memory_threshold);

        Self {
            host,
            children: Mutex::new(Vec::new()),
            settings,
            effective_cores,
            cpu_threshold_percent,
            memory_threshold_bytes,
        }
    }

    /// Registers a child process for monitoring.
    ///
    /// A monitor for the child is created and started. Registering a PID that is already
    /// registered is a no-op.
    pub fn register(&self, pid: u32) {
        let monitor = ProcessMonitor::with_settings(
            pid,
            querier_for_pid(pid),
            self.effective_cores,
            self.settings.sample_interval,
            self.settings.sample_history_size,
        );
        self.register_monitor(monitor);
    }

    /// Registers a pre-built child monitor, transferring ownership to the health monitor.
    ///
    /// The monitor is started if it hasn't been already. Registering a PID that is already
    /// registered is a no-op, and the given monitor is dropped (and thereby stopped).
    pub fn register_monitor(&self, monitor: ProcessMonitor) {
        let mut children = self.children.lock().unwrap();
        if children.iter().any(|existing| existing.pid() == monitor.pid()) {
            warn!(pid = monitor.pid(), "Child process already registered for health monitoring.");
            return;
        }

        debug!(pid = monitor.pid(), "Registering child process for health monitoring.");
        monitor.start();
        children.push(monitor);
    }

    /// Unregisters a child process, stopping its monitor.
    ///
    /// Unregistering a PID that was never registered is a no-op.
    pub fn unregister(&self, pid: u32) {
        let mut children = self.children.lock().unwrap();
        if let Some(idx) = children.iter().position(|monitor| monitor.pid() == pid) {
            debug!(pid, "Unregistering child process from health monitoring.");
            let monitor = children.swap_remove(idx);
            monitor.stop();
        }
    }

    /// Computes the current health verdict for the process tree.
    pub fn status(&self) -> HealthVerdict {
        // Snapshot the host first and then the current child set, so a register/unregister
        // racing this call affects at most whether the child is included, never coherence.
        let host_stats = self.host.stats();
        let child_stats = {
            let children = self.children.lock().unwrap();
            children.iter().map(|monitor| monitor.stats()).collect::<Vec<_>>()
        };

        let cpu = self.cpu_verdict(&host_stats, &child_stats);
        let memory = self
            .memory_threshold_bytes
            .map(|threshold| self.memory_verdict(&host_stats, &child_stats, threshold));

        let combined = HealthVerdict::combine([Some(cpu), memory].into_iter().flatten());
        debug!(cpu_verdict = ?cpu, memory_verdict = ?memory, verdict = ?combined, "Evaluated host health.");
        combined
    }

    fn cpu_verdict(&self, host: &ProcessStats, children: &[ProcessStats]) -> HealthVerdict {
        let window = self.settings.min_sample_count;
        let host_average = match windowed_average(host.cpu_percent(), window) {
            Some(average) => average,
            None => return HealthVerdict::Unknown,
        };

        let child_sum: f64 = children
            .iter()
            .filter_map(|stats| windowed_average(stats.cpu_percent(), window))
            .sum();

        let aggregate = (host_average + child_sum).round();
        gauge!("host_health.aggregate_cpu_percent").set(aggregate);

        if aggregate >= self.cpu_threshold_percent {
            warn!(
                aggregate_cpu_percent = aggregate,
                threshold_percent = self.cpu_threshold_percent,
                "Host CPU threshold exceeded."
            );
            HealthVerdict::Overloaded
        } else {
            HealthVerdict::Ok
        }
    }

    fn memory_verdict(&self, host: &ProcessStats, children: &[ProcessStats], threshold_bytes: f64) -> HealthVerdict {
        let window = self.settings.min_sample_count;
        let host_average = match windowed_average_bytes(host.memory_bytes(), window) {
            Some(average) => average,
            None => return HealthVerdict::Unknown,
        };

        let child_sum: f64 = children
            .iter()
            .filter_map(|stats| windowed_average_bytes(stats.memory_bytes(), window))
            .sum();

        let aggregate = (host_average + child_sum).round();
        gauge!("host_health.aggregate_memory_bytes").set(aggregate);

        if aggregate >= threshold_bytes {
            warn!(
                aggregate_memory_bytes = aggregate,
                threshold_bytes, "Host memory threshold exceeded."
            );
            HealthVerdict::Overloaded
        } else {
            HealthVerdict::Ok
        }
    }
}

/// Averages the last `window` samples.
///
/// Returns `None` when fewer than `window` samples exist: a process that hasn't been observed
/// long enough contributes nothing rather than dragging the aggregate down with a partial
/// average.
fn windowed_average(samples: &[f64], window: usize) -> Option<f64> {
    if window == 0 || samples.len() < window {
        return None;
    }

    let recent = &samples[samples.len() - window..];
    Some(recent.iter().sum::<f64>() / window as f64)
}

fn windowed_average_bytes(samples: &[usize], window: usize) -> Option<f64> {
    if window == 0 || samples.len() < window {
        return None;
    }

    let recent = &samples[samples.len() - window..];
    Some(recent.iter().map(|&bytes| bytes as f64).sum::<f64>() / window as f64)
}
