use super::{
    errors::TaskError,
    model::{
        CountersSnapshot,
        Outcome,
        RateSample,
    },
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;


/// Process-lifetime outcome tallies shared by every executor.
///
/// Create one, wrap it in an `Arc` and hand clones to whatever records or
/// reports. Each field is updated independently.
#[derive(Debug, Default)]
pub struct Counters {
    total: AtomicU64,
    failed: AtomicU64,
    deadline_failed: AtomicU64,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accounts one finished attempt. `total` always moves by exactly one.
    pub fn record<T>(&self, result: &Result<T, TaskError>) -> Outcome {
        let outcome = match result {
            Ok(_) => Outcome::Success,
            Err(e) if e.is_deadline() => Outcome::DeadlineExceeded,
            Err(_) => Outcome::Failure,
        };
        self.record_outcome(outcome);
        outcome
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        match outcome {
            Outcome::Success => {}
            Outcome::DeadlineExceeded => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.deadline_failed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failure => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deadline_failed(&self) -> u64 {
        self.deadline_failed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            total: self.total(),
            failed: self.failed(),
            deadline_failed: self.deadline_failed(),
        }
    }

    /// Samples `total` twice, `interval` apart.
    pub async fn sample_rate(&self, interval: Duration) -> RateSample {
        let before = self.total();
        tokio::time::sleep(interval).await;
        let after = self.total();
        RateSample {
            completed: after.saturating_sub(before),
            interval,
        }
    }

    /// Periodic reporting with a callback.
    /// Call `cancel()` on the returned token to stop it and release the `Arc`.
    pub fn start_monitoring<F>(self: &Arc<Self>, interval: Duration, callback: F) -> CancellationToken
    where
        F: Fn(CountersSnapshot, RateSample) + Send + 'static,
    {
        let counters = Arc::clone(self);
        let token = CancellationToken::new();
        let token_clone = token.clone();

        tokio::spawn(async move {
            let mut previous = counters.snapshot();
            let mut last_tick = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let current = counters.snapshot();
                        let now = tokio::time::Instant::now();
                        let sample = RateSample {
                            completed: current.completed_since(&previous),
                            interval: now - last_tick,
                        };
                        callback(current, sample);
                        previous = current;
                        last_tick = now;
                    }
                    _ = token_clone.cancelled() => {
                        drop(counters);
                        break;
                    }
                }
            }
        });

        token
    }
}
