use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

/// Cap on how far a single adjustment can accelerate: delta is `1 + min(run, 5)`.
const MAX_ADJUSTMENT_RUN_SPEED: u32 = 5;

/// A point-in-time view of one function's concurrency state.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ConcurrencySnapshot {
    /// The number of invocations the controller currently sanctions for the function.
    pub current_parallelism: usize,

    /// The number of invocations currently in flight.
    pub outstanding_invocations: usize,

    /// How many additional invocations the listener may start right now.
    ///
    /// Zero whenever throttling is active, regardless of available parallelism.
    pub fetch_count: usize,
}

/// Per-function limits, copied out of the manager's configuration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AdjustmentLimits {
    pub max_parallelism: usize,
    pub adjustment_frequency: Duration,
    pub quiet_window: Duration,
    pub run_window: Duration,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AdjustmentDirection {
    Up,
    Down,
}

#[derive(Debug)]
struct InvocationCounts {
    outstanding: usize,
    high_water: usize,
}

#[derive(Debug)]
struct AdjustmentState {
    last_adjustment: Instant,
    last_failed_adjustment: Option<Instant>,
    run_direction: AdjustmentDirection,
    run_count: u32,
}

impl AdjustmentState {
    /// Computes the magnitude of the next adjustment and advances the run tracking.
    ///
    /// Consecutive same-direction adjustments within the run window accelerate: the first
    /// moves by 1, the next by 2, and so on up to the cap. Changing direction, or letting the
    /// run window lapse, starts a fresh run.
    fn next_delta(&mut self, direction: AdjustmentDirection, now: Instant, run_window: Duration) -> usize {
        if self.run_direction != direction || now.duration_since(self.last_adjustment) > run_window {
            self.run_count = 0;
        }

        let speed = self.run_count.min(MAX_ADJUSTMENT_RUN_SPEED);
        self.run_count += 1;
        self.run_direction = direction;

        (1 + speed) as usize
    }
}

/// The concurrency state of a single function.
///
/// Invocation accounting (`function_started` / `function_completed` and the high-water mark)
/// arrives from arbitrary listener threads and is guarded by a lock. The parallelism value
/// itself is only ever written by the manager's status path, which the contract says is not
/// called concurrently for one function, so it lives in an atomic that `fetch_count` can read
/// without taking the lock.
pub(crate) struct FunctionConcurrency {
    limits: AdjustmentLimits,
    throttled: Arc<AtomicBool>,
    current_parallelism: AtomicUsize,
    invocations: Mutex<InvocationCounts>,
    adjustment: Mutex<AdjustmentState>,
}

impl FunctionConcurrency {
    pub(crate) fn new(limits: AdjustmentLimits, throttled: Arc<AtomicBool>) -> Self {
        Self {
            limits,
            throttled,
            current_parallelism: AtomicUsize::new(1),
            invocations: Mutex::new(InvocationCounts {
                outstanding: 0,
                high_water: 0,
            }),
            adjustment: Mutex::new(AdjustmentState {
                last_adjustment: Instant::now(),
                last_failed_adjustment: None,
                run_direction: AdjustmentDirection::Up,
                run_count: 0,
            }),
        }
    }

    pub(crate) fn current_parallelism(&self) -> usize {
        self.current_parallelism.load(Relaxed)
    }

    pub(crate) fn outstanding_invocations(&self) -> usize {
        self.invocations.lock().unwrap().outstanding
    }

    pub(crate) fn function_started(&self) {
        let mut counts = self.invocations.lock().unwrap();
        counts.outstanding += 1;
        if counts.outstanding > counts.high_water {
            counts.high_water = counts.outstanding;
        }
    }

    pub(crate) fn function_completed(&self) {
        let mut counts = self.invocations.lock().unwrap();
        counts.outstanding = counts.outstanding.saturating_sub(1);
    }

    pub(crate) fn snapshot(&self) -> ConcurrencySnapshot {
        let outstanding = self.outstanding_invocations();
        let current_parallelism = self.current_parallelism();
        let fetch_count = if self.throttled.load(Relaxed) {
            0
        } else {
            current_parallelism.saturating_sub(outstanding)
        };

        ConcurrencySnapshot {
            current_parallelism,
            outstanding_invocations: outstanding,
            fetch_count,
        }
    }

    /// Whether enough time has passed since the last adjustment to allow another.
    pub(crate) fn can_adjust(&self, now: Instant) -> bool {
        let adjustment = self.adjustment.lock().unwrap();
        now.duration_since(adjustment.last_adjustment) > self.limits.adjustment_frequency
    }

    pub(crate) fn can_decrease(&self) -> bool {
        self.current_parallelism() > 1
    }

    /// Whether parallelism may grow right now.
    ///
    /// A recent decrease forbids growth for the quiet window; once the window lapses, the
    /// failure mark is cleared. Growth is also gated on utilization: if the function never
    /// used the parallelism it already has since the last adjustment, more would be idle
    /// headroom, not throughput.
    pub(crate) fn can_increase(&self, now: Instant) -> bool {
        {
            let mut adjustment = self.adjustment.lock().unwrap();
            if let Some(failed_at) = adjustment.last_failed_adjustment {
                if now.duration_since(failed_at) <= self.limits.quiet_window {
                    return false;
                }
                adjustment.last_failed_adjustment = None;
            }
        }

        let current_parallelism = self.current_parallelism();
        let high_water = self.invocations.lock().unwrap().high_water;
        if high_water < current_parallelism {
            return false;
        }

        current_parallelism < self.limits.max_parallelism
    }

    /// Raises parallelism, returning the new value.
    pub(crate) fn increase(&self, now: Instant) -> usize {
        let delta = self
            .adjustment
            .lock()
            .unwrap()
            .next_delta(AdjustmentDirection::Up, now, self.limits.run_window);

        let raised = (self.current_parallelism() + delta).min(self.limits.max_parallelism);
        self.current_parallelism.store(raised, Relaxed);

        self.finish_adjustment(now, false);
        raised
    }

    /// Lowers parallelism, returning the new value.
    ///
    /// The floor is 1, and the decrease marks the start of the quiet window.
    pub(crate) fn decrease(&self, now: Instant) -> usize {
        let delta = self
            .adjustment
            .lock()
            .unwrap()
            .next_delta(AdjustmentDirection::Down, now, self.limits.run_window);

        let lowered = self.current_parallelism().saturating_sub(delta).max(1);
        self.current_parallelism.store(lowered, Relaxed);

        self.finish_adjustment(now, true);
        lowered
    }

    fn finish_adjustment(&self, now: Instant, failed: bool) {
        {
            let mut adjustment = self.adjustment.lock().unwrap();
            adjustment.last_adjustment = now;
            if failed {
                adjustment.last_failed_adjustment = Some(now);
            }
        }

        // Utilization starts over: growth must be re-earned against the new parallelism.
        self.invocations.lock().unwrap().high_water = 0;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const TEST_LIMITS: AdjustmentLimits = AdjustmentLimits {
        max_parallelism: 100,
        adjustment_frequency: Duration::from_secs(5),
        quiet_window: Duration::from_secs(30),
        run_window: Duration::from_secs(10),
    };

    fn status() -> FunctionConcurrency {
        FunctionConcurrency::new(TEST_LIMITS, Arc::new(AtomicBool::new(false)))
    }

    fn throttled_status() -> (FunctionConcurrency, Arc<AtomicBool>) {
        let throttled = Arc::new(AtomicBool::new(false));
        let status = FunctionConcurrency::new(TEST_LIMITS, Arc::clone(&throttled));
        (status, throttled)
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_count_reflects_available_room() {
        let (status, throttled) = throttled_status();

        assert_eq!(status.snapshot().fetch_count, 1);

        status.function_started();
        assert_eq!(status.snapshot().fetch_count, 0);

        // Throttling zeroes the fetch count regardless of room.
        status.function_completed();
        throttled.store(true, Relaxed);
        assert_eq!(status.snapshot().fetch_count, 0);
        assert_eq!(status.snapshot().current_parallelism, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_count_is_zero_when_over_committed() {
        let status = status();

        // More outstanding work than sanctioned parallelism, as can happen right after a
        // decrease: the fetch count saturates at zero.
        status.function_started();
        status.function_started();
        status.function_started();
        let snapshot = status.snapshot();
        assert_eq!(snapshot.outstanding_invocations, 3);
        assert_eq!(snapshot.fetch_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_direction_adjustments_accelerate() {
        let status = status();
        let mut now = Instant::now();

        // First increase moves by 1, and each same-direction adjustment within the run window
        // moves one further, capping at 6.
        let mut observed = Vec::new();
        for _ in 0..8 {
            now += Duration::from_secs(6);
            observed.push(status.increase(now));
        }
        assert_eq!(observed, vec![2, 4, 7, 11, 16, 22, 28, 34]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_breaks_after_the_window_lapses() {
        let status = status();
        let mut now = Instant::now();

        now += Duration::from_secs(6);
        assert_eq!(status.increase(now), 2);
        now += Duration::from_secs(6);
        assert_eq!(status.increase(now), 4);

        // Eleven seconds of quiet breaks the run; the next increase is back to 1.
        now += Duration::from_secs(11);
        assert_eq!(status.increase(now), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn direction_change_resets_the_run() {
        let status = status();
        let mut now = Instant::now();

        for _ in 0..3 {
            now += Duration::from_secs(6);
            status.increase(now);
        }
        assert_eq!(status.current_parallelism(), 7);

        // First decrease after a run of increases moves by 1, then accelerates in turn.
        now += Duration::from_secs(6);
        assert_eq!(status.decrease(now), 6);
        now += Duration::from_secs(6);
        assert_eq!(status.decrease(now), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn decrease_clamps_at_one() {
        let status = status();
        let mut now = Instant::now();

        now += Duration::from_secs(6);
        status.increase(now);

        now += Duration::from_secs(6);
        assert_eq!(status.decrease(now), 1);
        assert!(!status.can_decrease());
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_window_forbids_growth_after_a_decrease() {
        let status = status();
        let mut now = Instant::now();

        // Grow to 4, use all of it, then get knocked down.
        now += Duration::from_secs(6);
        status.increase(now);
        now += Duration::from_secs(6);
        status.increase(now);
        for _ in 0..4 {
            status.function_started();
        }
        now += Duration::from_secs(6);
        status.decrease(now);

        // The decrease reset the high-water mark; keep the remaining work visible so the
        // utilization gate is satisfied and only the quiet window is in play.
        status.function_started();

        // Inside the quiet window, utilization doesn't matter.
        now += Duration::from_secs(20);
        assert!(!status.can_increase(now));

        // Past it, the failure mark clears and growth is allowed again.
        now += Duration::from_secs(11);
        assert!(status.can_increase(now));
    }

    #[tokio::test(start_paused = true)]
    async fn growth_requires_the_headroom_to_have_been_used() {
        let status = status();
        let mut now = Instant::now();

        for _ in 0..3 {
            now += Duration::from_secs(6);
            for _ in 0..status.current_parallelism() {
                status.function_started();
            }
            assert!(status.can_increase(now));
            status.increase(now);
        }
        assert_eq!(status.current_parallelism(), 7);

        // The adjustment reset the high-water mark, and nothing has run since.
        now += Duration::from_secs(6);
        assert!(!status.can_increase(now));
    }

    #[tokio::test(start_paused = true)]
    async fn adjustment_floor_is_enforced() {
        let status = status();
        let now = Instant::now();

        assert!(!status.can_adjust(now + Duration::from_secs(4)));
        assert!(status.can_adjust(now + Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn parallelism_caps_at_the_limit() {
        let limits = AdjustmentLimits {
            max_parallelism: 4,
            ..TEST_LIMITS
        };
        let status = FunctionConcurrency::new(limits, Arc::new(AtomicBool::new(false)));
        let mut now = Instant::now();

        now += Duration::from_secs(6);
        status.increase(now);
        now += Duration::from_secs(6);
        status.increase(now);
        assert_eq!(status.current_parallelism(), 4);

        status.function_started();
        status.function_started();
        status.function_started();
        status.function_started();
        now += Duration::from_secs(6);
        assert!(!status.can_increase(now));
    }

    proptest! {
        #[test]
        fn invariants_hold_over_arbitrary_histories(ops in prop::collection::vec(0u8..4, 1..200)) {
            let status = FunctionConcurrency::new(TEST_LIMITS, Arc::new(AtomicBool::new(false)));
            let mut now = Instant::now();
            let mut starts = 0usize;
            let mut completions = 0usize;

            for op in ops {
                match op {
                    0 => {
                        status.function_started();
                        starts += 1;
                    }
                    1 => {
                        // Listeners only report completions for invocations they started.
                        if completions < starts {
                            status.function_completed();
                            completions += 1;
                        }
                    }
                    2 => {
                        now += Duration::from_secs(6);
                        if status.can_increase(now) {
                            status.increase(now);
                        }
                    }
                    _ => {
                        now += Duration::from_secs(6);
                        if status.can_decrease() {
                            status.decrease(now);
                        }
                    }
                }

                let snapshot = status.snapshot();
                prop_assert!(snapshot.current_parallelism >= 1);
                prop_assert!(snapshot.current_parallelism <= TEST_LIMITS.max_parallelism);
                prop_assert_eq!(snapshot.outstanding_invocations, starts - completions);
                prop_assert!(
                    snapshot.outstanding_invocations + snapshot.fetch_count <= snapshot.current_parallelism
                        || snapshot.fetch_count == 0
                );
            }
        }
    }
}
