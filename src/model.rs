use std::time::Duration;

/// Point-in-time copy of the outcome counters.
///
/// The three fields are read one after another, so a snapshot taken while
/// workers are running is approximate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub total: u64,
    pub failed: u64,
    pub deadline_failed: u64,
}

impl CountersSnapshot {
    #[inline]
    pub fn succeeded(&self) -> u64 {
        self.total.saturating_sub(self.failed)
    }

    /// `deadline_failed / total`, `None` while nothing has completed yet.
    pub fn deadline_failure_ratio(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.deadline_failed as f64 / self.total as f64)
    }

    pub fn failure_ratio(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.failed as f64 / self.total as f64)
    }

    /// Completed attempts between `earlier` and `self`.
    #[inline]
    pub fn completed_since(&self, earlier: &CountersSnapshot) -> u64 {
        self.total.saturating_sub(earlier.total)
    }
}

/// Δtotal observed over one sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    pub completed: u64,
    pub interval: Duration,
}

impl RateSample {
    pub fn per_second(&self) -> f64 {
        if self.interval.is_zero() {
            return 0.0;
        }
        self.completed as f64 / self.interval.as_secs_f64()
    }
}

/// Which counter bucket a finished attempt lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    DeadlineExceeded,
    Failure,
}

#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub workers: usize,
    pub idle_workers: usize,
    pub queued_tasks: usize,
    pub active_tasks: usize,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        if self.workers == 0 {
            return 0.0;
        }
        self.active_tasks as f64 / self.workers as f64
    }
}
