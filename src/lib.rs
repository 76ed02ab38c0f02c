//! Bounded-concurrency runner for blocking remote calls under per-task deadlines
//!
//! # Features
//! - Fixed worker pool over a bounded queue with backpressure on submit
//! - Per-task deadline scopes derived from an explicit parent token
//! - Forced abort of blocked sockets after a configurable grace delay
//! - Post-call deadline check: late results never count as success
//! - Lock-free outcome counters with rate sampling and periodic monitoring

pub mod counters;
pub mod dispatcher;
pub mod errors;
pub mod executor;
pub mod model;
pub mod pool;
pub mod scope;
pub mod watcher;

pub use counters::Counters;
pub use dispatcher::Dispatcher;
pub use errors::{ConfigError, OperationError, SubmitError, TaskError};
pub use executor::Executor;
pub use model::{CountersSnapshot, Outcome, PoolMetrics, RateSample};
pub use pool::{Config, Task, WorkerPool, WorkerPoolInner};
pub use scope::DeadlineScope;
pub use watcher::{Abort, DeadlineWatcher, WatchGuard, WatchState};
