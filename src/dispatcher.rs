use super::{
    errors::SubmitError,
    pool::WorkerPool,
};
use std::future::Future;


/// Driving loop: keeps producing tasks and feeding them to the pool.
///
/// Backpressure comes from `submit`; the dispatcher never runs ahead of the
/// pool by more than the queue capacity.
pub struct Dispatcher {
    pool: WorkerPool,
    limit: Option<u64>,
}

impl Dispatcher {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool, limit: None }
    }

    /// Stop after `limit` accepted tasks.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns the number of tasks the pool accepted.
    pub async fn run<M, F>(self, mut make_task: M) -> u64
    where
        M: FnMut(u64) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        let mut submitted = 0u64;
        while self.limit.map_or(true, |limit| submitted < limit) {
            match self.pool.submit(make_task(submitted)).await {
                Ok(()) => submitted += 1,
                Err(SubmitError::Closed) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "dispatcher stopped on refused submit");
                    break;
                }
            }
        }
        tracing::debug!(submitted, "dispatcher finished");
        submitted
    }
}
