//! Fake metrics sources, for tests and unsupported platforms.

use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

use crate::ProcessMetrics;

/// A metrics source that never produces a reading.
///
/// Monitors built over it accumulate no samples, which downstream consumers treat as an
/// unknown-health process.
pub struct NullMetrics;

impl ProcessMetrics for NullMetrics {
    fn cpu_time(&mut self) -> Option<Duration> {
        None
    }

    fn memory_usage(&mut self) -> Option<usize> {
        None
    }
}

/// A metrics source that replays a fixed script of readings, then dries up.
pub struct ScriptedMetrics {
    cpu: VecDeque<Option<Duration>>,
    memory: VecDeque<Option<usize>>,
}

impl ScriptedMetrics {
    /// Creates a source that returns the given readings in order, one per call, and `None`
    /// once a script is exhausted.
    pub fn new(cpu: Vec<Option<Duration>>, memory: Vec<Option<usize>>) -> Self {
        Self {
            cpu: cpu.into(),
            memory: memory.into(),
        }
    }
}

impl ProcessMetrics for ScriptedMetrics {
    fn cpu_time(&mut self) -> Option<Duration> {
        self.cpu.pop_front().flatten()
    }

    fn memory_usage(&mut self) -> Option<usize> {
        self.memory.pop_front().flatten()
    }
}

/// A metrics source simulating a process with a steady CPU utilization and a fixed memory
/// footprint.
///
/// CPU time accrues as a constant fraction of wall-clock time from the moment of construction,
/// so under a paused Tokio clock the reported load is exact.
pub struct SyntheticLoad {
    started: Instant,
    cpu_fraction: f64,
    memory_bytes: Option<usize>,
}

impl SyntheticLoad {
    /// Creates a source consuming `cpu_fraction` of one core (e.g. `0.85` for 85%) and holding
    /// `memory_bytes` of resident memory.
    pub fn new(cpu_fraction: f64, memory_bytes: Option<usize>) -> Self {
        Self {
            started: Instant::now(),
            cpu_fraction,
            memory_bytes,
        }
    }
}

impl ProcessMetrics for SyntheticLoad {
    fn cpu_time(&mut self) -> Option<Duration> {
        Some(self.started.elapsed().mul_f64(self.cpu_fraction))
    }

    fn memory_usage(&mut self) -> Option<usize> {
        self.memory_bytes
    }
}
