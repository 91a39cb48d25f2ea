use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::ProcessMetrics;

/// Default interval between samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of samples retained per history.
pub const DEFAULT_SAMPLE_HISTORY_SIZE: usize = 10;

/// An immutable snapshot of a monitor's sample histories.
///
/// Both histories are ordered oldest-first, and are copied out together under the monitor's
/// lock, so a snapshot always holds a coherent pair.
#[derive(Clone, Debug)]
pub struct ProcessStats {
    cpu_percent: Vec<f64>,
    memory_bytes: Vec<usize>,
}

impl ProcessStats {
    /// CPU load samples, as percentages of a single effective core.
    pub fn cpu_percent(&self) -> &[f64] {
        &self.cpu_percent
    }

    /// Resident memory samples, in bytes.
    pub fn memory_bytes(&self) -> &[usize] {
        &self.memory_bytes
    }
}

struct Histories {
    cpu_percent: VecDeque<f64>,
    memory_bytes: VecDeque<usize>,
    last_cpu_reading: Option<(Instant, Duration)>,
}

impl Histories {
    fn new(capacity: usize) -> Self {
        Self {
            cpu_percent: VecDeque::with_capacity(capacity),
            memory_bytes: VecDeque::with_capacity(capacity),
            last_cpu_reading: None,
        }
    }

    fn record(&mut self, source: &mut dyn ProcessMetrics, now: Instant, effective_cores: usize, capacity: usize) {
        // A failed reading produces no sample and no error: the process may simply have exited,
        // and the monitor's owner is expected to dispose of it eventually.
        if let Some(cpu_time) = source.cpu_time() {
            if let Some((last_at, last_cpu_time)) = self.last_cpu_reading {
                let interval_ms = now.duration_since(last_at).as_millis();
                if interval_ms > 0 {
                    let used_ms = cpu_time.saturating_sub(last_cpu_time).as_millis();
                    let load = (used_ms as f64 / (effective_cores as f64 * interval_ms as f64) * 100.0).round();
                    push_bounded(&mut self.cpu_percent, load, capacity);
                }
            }

            // The reading becomes the baseline for the next sample. On the very first reading
            // there's no baseline yet, so no CPU sample is produced above.
            self.last_cpu_reading = Some((now, cpu_time));
        }

        if let Some(bytes) = source.memory_usage() {
            push_bounded(&mut self.memory_bytes, bytes, capacity);
        }
    }

    fn stats(&self) -> ProcessStats {
        ProcessStats {
            cpu_percent: self.cpu_percent.iter().copied().collect(),
            memory_bytes: self.memory_bytes.iter().copied().collect(),
        }
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T, capacity: usize) {
    while history.len() >= capacity {
        history.pop_front();
    }
    history.push_back(value);
}

/// A periodic sampler of one process's CPU and memory usage.
///
/// Once started, the monitor samples its metrics source at a fixed interval, appending a
/// CPU-percentage sample (normalized to the configured effective core count) and a memory
/// sample to two bounded histories. When a history is full, the oldest sample is evicted.
///
/// Sampling stops when [`stop`][Self::stop] is called or the monitor is dropped.
pub struct ProcessMonitor {
    pid: u32,
    effective_cores: usize,
    sample_interval: Duration,
    history_size: usize,
    histories: Arc<Mutex<Histories>>,
    source: Mutex<Option<Box<dyn ProcessMetrics>>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessMonitor {
    /// Creates a monitor for the given process with the default sampling interval and history
    /// size.
    pub fn new(pid: u32, source: Box<dyn ProcessMetrics>, effective_cores: usize) -> Self {
        Self::with_settings(
            pid,
            source,
            effective_cores,
            DEFAULT_SAMPLE_INTERVAL,
            DEFAULT_SAMPLE_HISTORY_SIZE,
        )
    }

    /// Creates a monitor with an explicit sampling interval and history size.
    pub fn with_settings(
        pid: u32, source: Box<dyn ProcessMetrics>, effective_cores: usize, sample_interval: Duration,
        history_size: usize,
    ) -> Self {
        Self {
            pid,
            effective_cores: effective_cores.max(1),
            sample_interval,
            history_size: history_size.max(1),
            histories: Arc::new(Mutex::new(Histories::new(history_size.max(1)))),
            source: Mutex::new(Some(source)),
            sampler: Mutex::new(None),
        }
    }

    /// The PID of the monitored process.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Starts the sampling task.
    ///
    /// Calling `start` more than once is a no-op, as is starting a monitor that has already
    /// been stopped. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut sampler = self.sampler.lock().unwrap();
        if sampler.is_some() {
            return;
        }

        let mut source = match self.source.lock().unwrap().take() {
            Some(source) => source,
            None => return,
        };

        let histories = Arc::clone(&self.histories);
        let effective_cores = self.effective_cores;
        let history_size = self.history_size;
        let sample_interval = self.sample_interval;
        let pid = self.pid;

        debug!(pid, ?sample_interval, "Starting process monitor.");

        *sampler = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + sample_interval, sample_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let now = Instant::now();
                histories
                    .lock()
                    .unwrap()
                    .record(source.as_mut(), now, effective_cores, history_size);
            }
        }));
    }

    /// Returns an independent snapshot of both sample histories.
    pub fn stats(&self) -> ProcessStats {
        self.histories.lock().unwrap().stats()
    }

    /// Stops the sampling task.
    ///
    /// Idempotent. Also invoked on drop.
    pub fn stop(&self) {
        if let Some(sampler) = self.sampler.lock().unwrap().take() {
            debug!(pid = self.pid, "Stopping process monitor.");
            sampler.abort();
        }
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{NullMetrics, ScriptedMetrics, SyntheticLoad};

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn first_reading_produces_no_cpu_sample() {
        let mut histories = Histories::new(10);
        let mut source = ScriptedMetrics::new(vec![Some(ms(100))], vec![Some(4096)]);

        let now = Instant::now();
        histories.record(&mut source, now, 1, 10);

        let stats = histories.stats();
        assert!(stats.cpu_percent().is_empty());
        assert_eq!(stats.memory_bytes(), &[4096]);
    }

    #[test]
    fn cpu_load_normalized_to_effective_cores() {
        let mut histories = Histories::new(10);
        let mut source = ScriptedMetrics::new(
            vec![Some(ms(100)), Some(ms(600)), Some(ms(2600))],
            vec![Some(1), Some(2), Some(3)],
        );

        let start = Instant::now();
        histories.record(&mut source, start, 2, 10);
        histories.record(&mut source, start + ms(1000), 2, 10);
        histories.record(&mut source, start + ms(2000), 2, 10);

        // 500ms of CPU over 1s across 2 cores is 25%; 2000ms over 1s across 2 cores is 100%.
        let stats = histories.stats();
        assert_eq!(stats.cpu_percent(), &[25.0, 100.0]);
        assert_eq!(stats.memory_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn failed_reading_is_skipped_without_skewing_the_rate() {
        let mut histories = Histories::new(10);
        let mut source = ScriptedMetrics::new(
            vec![Some(ms(0)), None, Some(ms(1000))],
            vec![Some(1), None, Some(3)],
        );

        let start = Instant::now();
        histories.record(&mut source, start, 1, 10);
        histories.record(&mut source, start + ms(1000), 1, 10);
        histories.record(&mut source, start + ms(2000), 1, 10);

        // The middle reading failed, so the one CPU sample spans the full two seconds: 1000ms
        // of CPU over 2000ms is 50%, not 100%.
        let stats = histories.stats();
        assert_eq!(stats.cpu_percent(), &[50.0]);
        assert_eq!(stats.memory_bytes(), &[1, 3]);
    }

    #[test]
    fn histories_evict_oldest_at_capacity() {
        let mut histories = Histories::new(3);
        let mut source = ScriptedMetrics::new(vec![None; 6], (1..=6usize).map(Some).collect());

        let start = Instant::now();
        for i in 0..6 {
            histories.record(&mut source, start + ms(i * 1000), 1, 3);
        }

        assert_eq!(histories.stats().memory_bytes(), &[4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_samples_on_interval() {
        let monitor = ProcessMonitor::new(42, Box::new(SyntheticLoad::new(0.25, Some(1024))), 1);
        monitor.start();

        tokio::time::sleep(ms(3500)).await;

        let stats = monitor.stats();
        // Three ticks: the first establishes the CPU baseline, the rest produce 25% samples.
        assert_eq!(stats.cpu_percent(), &[25.0, 25.0]);
        assert_eq!(stats.memory_bytes(), &[1024, 1024, 1024]);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_monitor_samples_no_further() {
        let monitor = ProcessMonitor::new(42, Box::new(SyntheticLoad::new(0.5, Some(1))), 1);
        monitor.start();

        tokio::time::sleep(ms(2500)).await;
        monitor.stop();
        let frozen = monitor.stats().memory_bytes().len();

        tokio::time::sleep(ms(5000)).await;
        assert_eq!(monitor.stats().memory_bytes().len(), frozen);

        // Stopping again (or via drop) is fine.
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_stop_is_a_no_op() {
        let monitor = ProcessMonitor::new(42, Box::new(NullMetrics), 1);
        monitor.start();
        monitor.stop();
        monitor.start();

        tokio::time::sleep(ms(3000)).await;
        assert!(monitor.stats().memory_bytes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_are_independent_copies() {
        let monitor = ProcessMonitor::new(42, Box::new(SyntheticLoad::new(0.1, Some(7))), 1);
        monitor.start();

        tokio::time::sleep(ms(1500)).await;
        let before = monitor.stats();

        tokio::time::sleep(ms(1000)).await;
        let after = monitor.stats();

        assert_eq!(before.memory_bytes().len(), 1);
        assert_eq!(after.memory_bytes().len(), 2);
    }
}
