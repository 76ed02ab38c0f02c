use super::{
    errors::{OperationError, TaskError},
    watcher::{Abort, DeadlineWatcher, WatchGuard},
};
use std::sync::Arc;
use tokio::{
    runtime::Handle,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;


/// Cancellation scope governing one task's execution window.
///
/// Carries a child token of the caller's parent token, an absolute deadline
/// and the grace delay used by watchers armed on it. The scope is passed to
/// the operation explicitly; blocking code calls [`DeadlineScope::check`]
/// before starting more work and [`DeadlineScope::watch`] around calls that
/// can only be interrupted by tearing down their resource.
#[derive(Debug, Clone)]
pub struct DeadlineScope {
    token: CancellationToken,
    deadline: Instant,
    timeout: Duration,
    grace: Duration,
    runtime: Handle,
}

impl DeadlineScope {
    /// Must be called from within a tokio runtime.
    pub fn new(parent: &CancellationToken, timeout: Duration, grace: Duration) -> Self {
        Self::with_handle(parent, timeout, grace, Handle::current())
    }

    pub fn with_handle(
        parent: &CancellationToken,
        timeout: Duration,
        grace: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            token: parent.child_token(),
            deadline: deadline_after(timeout),
            timeout,
            grace,
            runtime,
        }
    }

    #[inline]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[inline]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    #[inline]
    pub fn deadline_exceeded(&self) -> bool {
        Instant::now() >= self.deadline
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Gate for chaining further work onto the task.
    pub fn check(&self) -> Result<(), OperationError> {
        if self.deadline_exceeded() {
            return Err(OperationError::DeadlineExceeded);
        }
        if self.is_cancelled() {
            return Err(OperationError::Cancelled);
        }
        Ok(())
    }

    /// Arms a watcher that aborts `resource` once this scope is cancelled and
    /// the grace delay passes without the guard being completed.
    pub fn watch<R>(&self, resource: Arc<R>) -> WatchGuard
    where
        R: Abort + Send + Sync + 'static,
    {
        DeadlineWatcher::new(self.token.clone(), self.grace, resource).arm(&self.runtime)
    }

    /// Cancels the scope; armed watchers start their grace timers.
    pub(crate) fn expire(&self) {
        self.token.cancel();
    }

    /// Post-call classification. The deadline is inspected even for `Ok`
    /// results: a blocking call can hand back output after its window closed.
    pub(crate) fn settle<T>(&self, result: Result<T, OperationError>) -> Result<T, TaskError> {
        if self.deadline_exceeded() {
            return Err(TaskError::DeadlineExceeded { timeout: self.timeout });
        }
        // A watcher may already have torn the resource down, so even `Ok` is void.
        if self.is_cancelled() {
            return match result {
                Err(OperationError::DeadlineExceeded) => {
                    Err(TaskError::DeadlineExceeded { timeout: self.timeout })
                }
                _ => Err(TaskError::Cancelled),
            };
        }
        match result {
            Ok(value) => Ok(value),
            Err(OperationError::DeadlineExceeded) => {
                Err(TaskError::DeadlineExceeded { timeout: self.timeout })
            }
            Err(OperationError::Cancelled) => Err(TaskError::Cancelled),
            Err(e) => Err(TaskError::Failed { error: e.to_string() }),
        }
    }
}

/// `now + timeout`, clamped to roughly thirty years out like tokio's own timers.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stale_success_is_rejected_after_deadline() {
        let parent = CancellationToken::new();
        let scope = DeadlineScope::new(&parent, Duration::from_millis(100), Duration::from_millis(10));

        assert!(scope.check().is_ok());
        assert_eq!(scope.settle(Ok(7)), Ok(7));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scope.deadline_exceeded());
        assert_eq!(scope.remaining(), Duration::ZERO);
        assert!(matches!(scope.check(), Err(OperationError::DeadlineExceeded)));
        assert_eq!(
            scope.settle(Ok(7)),
            Err(TaskError::DeadlineExceeded { timeout: Duration::from_millis(100) })
        );
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_scope_only_downwards() {
        let parent = CancellationToken::new();
        let scope = DeadlineScope::new(&parent, Duration::from_secs(10), Duration::from_millis(10));

        scope.expire();
        assert!(scope.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = DeadlineScope::new(&parent, Duration::from_secs(10), Duration::from_millis(10));
        parent.cancel();
        assert!(other.token().is_cancelled());
        assert!(matches!(other.check(), Err(OperationError::Cancelled)));
        assert_eq!(
            other.settle::<()>(Err(OperationError::Other("reset".into()))),
            Err(TaskError::Cancelled)
        );
        // a read cut short by the abort comes back as Ok(0)
        assert_eq!(other.settle(Ok(0usize)), Err(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn unbounded_timeout_does_not_overflow() {
        let parent = CancellationToken::new();
        let scope = DeadlineScope::new(&parent, Duration::MAX, Duration::from_millis(25));

        assert_eq!(scope.timeout(), Duration::MAX);
        assert_eq!(scope.grace(), Duration::from_millis(25));
        assert!(!scope.deadline_exceeded());
        assert!(scope.remaining() > Duration::from_secs(86_400 * 365));
        assert_eq!(scope.settle(Ok(1)), Ok(1));
    }

    #[tokio::test]
    async fn operation_errors_are_classified() {
        let parent = CancellationToken::new();
        let scope = DeadlineScope::new(&parent, Duration::from_secs(10), Duration::from_millis(10));

        assert_eq!(
            scope.settle::<()>(Err(OperationError::Other("refused".into()))),
            Err(TaskError::Failed { error: "refused".into() })
        );
        assert!(scope
            .settle::<()>(Err(OperationError::DeadlineExceeded))
            .unwrap_err()
            .is_deadline());
    }
}
