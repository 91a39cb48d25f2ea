//! Process CPU and memory sampling.
//!
//! This crate provides two pieces: a way to query the cumulative CPU time and current resident
//! memory of a process on demand, and a periodic monitor that turns those raw readings into
//! bounded histories of CPU-percentage and memory samples suitable for windowed health checks.
//!
//! ## Linux
//!
//! On Linux, [procfs](https://docs.kernel.org/filesystems/proc.html) is used:
//!
//! - `/proc/<pid>/stat`: read for the process's user and system CPU time, in clock ticks.
//! - `/proc/<pid>/statm`: read for the process's resident set size, in pages. This file is
//!   lazily updated and the least accurate of the procfs memory views, but is universally
//!   available and good enough for threshold checks over multi-second windows.
//!
//! ## Other platforms
//!
//! No support yet: queriers built through [`querier_for_pid`] report no readings, and monitors
//! built on them accumulate no samples.

#![deny(missing_docs)]

use std::time::Duration;

mod monitor;
pub use monitor::{ProcessMonitor, ProcessStats, DEFAULT_SAMPLE_HISTORY_SIZE, DEFAULT_SAMPLE_INTERVAL};

#[cfg(target_os = "linux")]
mod procfs;

#[cfg(target_os = "linux")]
pub use procfs::ProcfsQuerier;

pub mod test_util;

/// An on-demand source of process CPU and memory readings.
///
/// Implementations must hit the underlying OS interface on every call rather than serving a
/// cached view, since callers use consecutive readings to compute rates.
///
/// A `None` from either method means the reading could not be taken. This is an expected
/// condition rather than an error: the most common cause is the monitored process having
/// exited between samples.
pub trait ProcessMetrics: Send {
    /// Gets the total CPU time (user plus system) consumed by the process since it started.
    fn cpu_time(&mut self) -> Option<Duration>;

    /// Gets the process's current resident memory, in bytes.
    fn memory_usage(&mut self) -> Option<usize>;
}

/// Builds a metrics querier for the given process.
///
/// On unsupported platforms, the returned querier reports no readings.
pub fn querier_for_pid(pid: u32) -> Box<dyn ProcessMetrics> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcfsQuerier::with_pid(pid))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        Box::new(test_util::NullMetrics)
    }
}
