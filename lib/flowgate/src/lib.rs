//! Dynamic concurrency control for multi-function hosts.
//!
//! A host process runs many independently-triggered functions, each with its own listener
//! loop. flowgate sits between the listeners and the work: each loop asks the
//! [`ConcurrencyManager`] how many new invocations it may fetch right now, and reports the
//! start and completion of each one. The manager answers from two inputs:
//!
//! - a per-function adaptive parallelism limit, raised under sustained health and lowered
//!   under sustained pressure, with hysteresis and velocity shaping so the system neither
//!   thrashes nor starves, and
//! - a process-wide throttle derived from pluggable [`ThrottleProvider`]s (host CPU and
//!   memory pressure out of the box, plus a canary that detects executor starvation).
//!
//! The manager is a gate, not a scheduler: it never queues, reorders, or prioritizes work, it
//! only bounds how much of it may be in flight.
//!
//! ```no_run
//! use flowgate::{ConcurrencyConfiguration, ConcurrencyManager};
//! use flowgate_env::ComputePlan;
//!
//! # async fn example() -> Result<(), flowgate::ConfigurationError> {
//! let mut config = ConcurrencyConfiguration::with_defaults();
//! config.dynamic_concurrency_enabled = true;
//!
//! let plan = ComputePlan::detect();
//! let manager = ConcurrencyManager::with_default_providers(config, &plan)?;
//!
//! // In each listener loop:
//! let status = manager.get_status("process-orders");
//! for _ in 0..status.fetch_count {
//!     manager.function_started("process-orders");
//!     // ... dispatch the invocation; call `function_completed` when it finishes ...
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

mod config;
mod function;
mod manager;
mod throttle;

pub use self::config::{ConcurrencyConfiguration, ConfigurationError};
pub use self::function::ConcurrencySnapshot;
pub use self::manager::{ConcurrencyManager, ManagerSnapshot, ProviderReading};
pub use self::throttle::{
    HostHealthThrottleProvider, StarvationCanary, ThrottleProvider, ThrottleState, DEFAULT_CANARY_FAILURE_THRESHOLD,
    DEFAULT_CANARY_INTERVAL,
};
