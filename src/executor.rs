//! Runs one blocking operation under a deadline and accounts its outcome.
//!
//! ```text
//! parent token ──child──► DeadlineScope ──► spawn_blocking(operation(&scope))
//!                              │                        │
//!                  deadline ───┴─► scope.expire()       │  (watchers arm grace)
//!                                                       ▼
//!                       settle(): post-call deadline check ──► Counters::record (once)
//! ```

use super::{
    counters::Counters,
    errors::{OperationError, TaskError},
    pool::Config,
    scope::DeadlineScope,
};
use std::sync::Arc;
use tokio::{
    task::JoinError,
    time::Duration,
};
use tokio_util::sync::CancellationToken;


#[derive(Debug, Clone)]
pub struct Executor {
    counters: Arc<Counters>,
    grace: Duration,
    settle: Duration,
}

impl Executor {
    pub fn new(counters: Arc<Counters>, grace: Duration) -> Self {
        Self {
            counters,
            grace,
            settle: Duration::from_secs(1),
        }
    }

    pub fn from_config(counters: Arc<Counters>, config: &Config) -> Self {
        Self {
            counters,
            grace: config.grace,
            settle: config.settle,
        }
    }

    /// How long past `deadline + grace` the executor keeps waiting for a
    /// stuck call before it detaches the thread.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    #[inline]
    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    #[inline]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Runs `operation` on the blocking pool within `timeout` of now.
    ///
    /// Exactly one outcome is recorded per call. `DeadlineExceeded` is
    /// reported when the operation says so or when the deadline had passed by
    /// the time it returned, whatever it returned.
    pub async fn run_with_deadline<T, F>(
        &self,
        parent: &CancellationToken,
        timeout: Duration,
        operation: F,
    ) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce(&DeadlineScope) -> Result<T, OperationError> + Send + 'static,
    {
        let result = self.execute(parent, timeout, operation).await;
        self.counters.record(&result);

        if let Err(err) = &result {
            match err {
                TaskError::DeadlineExceeded { .. } => {
                    tracing::debug!(timeout = ?timeout, "task deadline exceeded");
                }
                TaskError::Panic(_) => {
                    tracing::error!(error = %err, label = err.as_label(), "task panicked");
                }
                _ => {
                    tracing::warn!(error = %err, label = err.as_label(), "task failed");
                }
            }
        }
        result
    }

    async fn execute<T, F>(
        &self,
        parent: &CancellationToken,
        timeout: Duration,
        operation: F,
    ) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce(&DeadlineScope) -> Result<T, OperationError> + Send + 'static,
    {
        if parent.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let scope = DeadlineScope::new(parent, timeout, self.grace);
        let op_scope = scope.clone();
        let mut join = tokio::task::spawn_blocking(move || {
            op_scope.check()?;
            operation(&op_scope)
        });

        let joined = tokio::select! {
            biased;
            res = &mut join => res,
            _ = tokio::time::sleep_until(scope.deadline()) => {
                scope.expire();
                match tokio::time::timeout(self.grace.saturating_add(self.settle), &mut join).await {
                    Ok(res) => res,
                    Err(_) => {
                        tracing::warn!(
                            timeout = ?timeout,
                            grace = ?self.grace,
                            "operation ignored its deadline and was not aborted, detaching it"
                        );
                        return Err(TaskError::DeadlineExceeded { timeout });
                    }
                }
            }
        };

        match joined {
            Ok(result) => scope.settle(result),
            Err(join_err) => Err(join_failure(join_err)),
        }
    }
}

fn join_failure(err: JoinError) -> TaskError {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        TaskError::Panic(message)
    } else {
        TaskError::Failed { error: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        time::Instant,
    };

    fn executor() -> Executor {
        Executor::new(Counters::new(), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn success_counts_once() {
        let exec = executor();
        let root = CancellationToken::new();

        let value = exec
            .run_with_deadline(&root, Duration::from_secs(1), |_| Ok(21 * 2))
            .await;
        assert_eq!(value, Ok(42));
        assert_eq!(exec.counters().total(), 1);
        assert_eq!(exec.counters().failed(), 0);
    }

    #[tokio::test]
    async fn stale_success_after_deadline_is_a_deadline_failure() {
        let exec = executor();
        let root = CancellationToken::new();

        let result = exec
            .run_with_deadline(&root, Duration::from_millis(30), |_| {
                std::thread::sleep(Duration::from_millis(60));
                Ok("stale rows")
            })
            .await;
        assert!(result.unwrap_err().is_deadline());
        let snap = exec.counters().snapshot();
        assert_eq!((snap.total, snap.failed, snap.deadline_failed), (1, 1, 1));
    }

    #[tokio::test]
    async fn other_failures_do_not_touch_deadline_counter() {
        let exec = executor();
        let root = CancellationToken::new();

        let result = exec
            .run_with_deadline::<(), _>(&root, Duration::from_secs(1), |_| {
                Err(OperationError::Other("relation does not exist".into()))
            })
            .await;
        assert_eq!(result, Err(TaskError::Failed { error: "relation does not exist".into() }));
        let snap = exec.counters().snapshot();
        assert_eq!((snap.total, snap.failed, snap.deadline_failed), (1, 1, 0));
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let exec = executor();
        let root = CancellationToken::new();

        let result = exec
            .run_with_deadline::<(), _>(&root, Duration::from_secs(1), |_| panic!("driver bug"))
            .await;
        assert_eq!(result, Err(TaskError::Panic("driver bug".into())));
        assert_eq!(exec.counters().failed(), 1);
    }

    #[tokio::test]
    async fn cancelled_parent_skips_the_operation() {
        let exec = executor();
        let root = CancellationToken::new();
        root.cancel();

        let result = exec
            .run_with_deadline::<(), _>(&root, Duration::from_secs(1), |_| {
                panic!("must not run")
            })
            .await;
        assert_eq!(result, Err(TaskError::Cancelled));
        assert_eq!(exec.counters().total(), 1);
        assert_eq!(exec.counters().deadline_failed(), 0);
    }

    #[tokio::test]
    async fn unbounded_timeout_is_still_accounted() {
        let exec = executor();
        let root = CancellationToken::new();

        let result = exec
            .run_with_deadline(&root, Duration::MAX, |scope| {
                scope.check()?;
                Ok(())
            })
            .await;
        assert_eq!(result, Ok(()));
        assert_eq!(exec.counters().total(), 1);
    }

    #[tokio::test]
    async fn unwatched_stuck_call_is_detached_after_settle() {
        let exec = executor().with_settle(Duration::from_millis(20));
        assert_eq!(exec.grace(), Duration::from_millis(50));
        let root = CancellationToken::new();
        let started = Instant::now();

        let result = exec
            .run_with_deadline(&root, Duration::from_millis(30), |_| {
                // nothing to abort: this call ignores the deadline entirely
                std::thread::sleep(Duration::from_millis(400));
                Ok(())
            })
            .await;

        let elapsed = started.elapsed();
        assert!(result.unwrap_err().is_deadline());
        assert!(elapsed >= Duration::from_millis(100), "detached early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(350), "waited for the call: {elapsed:?}");
        assert_eq!(exec.counters().deadline_failed(), 1);
    }

    #[tokio::test]
    async fn chained_work_is_refused_after_deadline() {
        let exec = executor();
        let root = CancellationToken::new();

        let result = exec
            .run_with_deadline::<(), _>(&root, Duration::from_millis(20), |scope| {
                std::thread::sleep(Duration::from_millis(40));
                scope.check()?;
                panic!("second stage must not start");
            })
            .await;
        assert!(result.unwrap_err().is_deadline());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_socket_read_is_aborted() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Arc::new(TcpStream::connect(addr).unwrap());
        let (_server, _) = listener.accept().unwrap();

        let exec = executor();
        let root = CancellationToken::new();
        let started = Instant::now();

        let result = exec
            .run_with_deadline::<usize, _>(&root, Duration::from_millis(100), move |scope| {
                let guard = scope.watch(client.clone());
                let mut buf = [0u8; 16];
                let read = (&*client).read(&mut buf);
                guard.complete();
                Ok(read?)
            })
            .await;

        assert!(result.unwrap_err().is_deadline());
        assert!(started.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn parent_cancel_during_watched_read_is_never_success() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Arc::new(TcpStream::connect(addr).unwrap());
        let (_server, _) = listener.accept().unwrap();

        let exec = executor();
        let root = CancellationToken::new();
        let canceller = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = exec
            .run_with_deadline::<usize, _>(&root, Duration::from_secs(5), move |scope| {
                let guard = scope.watch(client.clone());
                let mut buf = [0u8; 16];
                // returns Ok(0) or an error once the watcher shuts the socket down
                let read = (&*client).read(&mut buf);
                guard.complete();
                Ok(read?)
            })
            .await;

        assert_eq!(result, Err(TaskError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
        let snap = exec.counters().snapshot();
        assert_eq!(snap.succeeded(), 0);
        assert_eq!((snap.total, snap.failed, snap.deadline_failed), (1, 1, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fast_reply_leaves_socket_usable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Arc::new(TcpStream::connect(addr).unwrap());
        let (mut server, _) = listener.accept().unwrap();
        server.write_all(b"ab").unwrap();

        let exec = executor();
        let root = CancellationToken::new();
        for expected in [b'a', b'b'] {
            let client = client.clone();
            let byte = exec
                .run_with_deadline(&root, Duration::from_secs(1), move |scope| {
                    let guard = scope.watch(client.clone());
                    let mut buf = [0u8; 1];
                    (&*client).read_exact(&mut buf)?;
                    guard.complete();
                    Ok(buf[0])
                })
                .await;
            assert_eq!(byte, Ok(expected));
        }
        assert_eq!(exec.counters().failed(), 0);
    }
}
