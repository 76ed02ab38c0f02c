//! Forced abort of blocking resources whose scope has been cancelled.
//!
//! A blocked `read` on a socket does not observe a `CancellationToken`. The
//! watcher bridges the two: once the token fires it waits `grace` for the
//! call to return on its own, then tears the resource down so the call fails
//! and the thread is released.
//!
//! ```text
//! Idle ──arm──► Armed ──token cancelled + grace elapsed──► Fired (abort issued)
//!                 │
//!                 └──guard completed / dropped──────────► Satisfied (no abort)
//! ```
//!
//! Both exits go through one `compare_exchange` on the state byte, so exactly
//! one of them happens per watcher.

use std::{
    fmt,
    io,
    net::{Shutdown, TcpStream},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};
use tokio::{
    runtime::Handle,
    time::Duration,
};
use tokio_util::sync::CancellationToken;


/// A blocking I/O handle that can be torn down from another thread.
pub trait Abort {
    /// Forcibly terminates in-flight use. Must be safe to call while another
    /// thread is blocked on the resource.
    fn abort(&self) -> io::Result<()>;
}

impl Abort for TcpStream {
    fn abort(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[cfg(unix)]
impl Abort for std::os::unix::net::UnixStream {
    fn abort(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl<R: Abort + ?Sized> Abort for Arc<R> {
    fn abort(&self) -> io::Result<()> {
        (**self).abort()
    }
}

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const FIRED: u8 = 2;
const SATISFIED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Armed,
    Fired,
    Satisfied,
}

impl WatchState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            IDLE => WatchState::Idle,
            ARMED => WatchState::Armed,
            FIRED => WatchState::Fired,
            _ => WatchState::Satisfied,
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    done: CancellationToken,
}

impl Shared {
    #[inline]
    fn state(&self) -> WatchState {
        WatchState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Claims the terminal transition. Returns `true` for the single winner.
    #[inline]
    fn claim(&self, terminal: u8) -> bool {
        self.state
            .compare_exchange(ARMED, terminal, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// One watcher per guarded call.
pub struct DeadlineWatcher {
    shared: Arc<Shared>,
    token: CancellationToken,
    grace: Duration,
    resource: Arc<dyn Abort + Send + Sync>,
}

impl fmt::Debug for DeadlineWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineWatcher")
            .field("state", &self.shared.state())
            .field("grace", &self.grace)
            .finish()
    }
}

impl DeadlineWatcher {
    pub fn new<R>(token: CancellationToken, grace: Duration, resource: Arc<R>) -> Self
    where
        R: Abort + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(IDLE),
                done: CancellationToken::new(),
            }),
            token,
            grace,
            resource,
        }
    }

    #[inline]
    pub fn state(&self) -> WatchState {
        self.shared.state()
    }

    /// Starts observing the token on `runtime`. The returned guard must be
    /// completed (or dropped) when the guarded call returns.
    pub fn arm(self, runtime: &Handle) -> WatchGuard {
        self.shared.state.store(ARMED, Ordering::Release);
        let shared = self.shared.clone();
        runtime.spawn(watch(self.shared, self.token, self.grace, self.resource));
        WatchGuard { shared, finished: false }
    }
}

async fn watch(
    shared: Arc<Shared>,
    token: CancellationToken,
    grace: Duration,
    resource: Arc<dyn Abort + Send + Sync>,
) {
    tokio::select! {
        biased;
        _ = shared.done.cancelled() => return,
        _ = token.cancelled() => {}
    }

    tokio::select! {
        biased;
        _ = shared.done.cancelled() => return,
        _ = tokio::time::sleep(grace) => {}
    }

    if !shared.claim(FIRED) {
        return;
    }

    tracing::warn!(grace = ?grace, "operation still blocked after grace delay, aborting resource");
    if let Err(err) = resource.abort() {
        tracing::error!(error = %err, "resource abort failed");
    }
}

/// Completion side of an armed watcher.
#[derive(Debug)]
pub struct WatchGuard {
    shared: Arc<Shared>,
    finished: bool,
}

impl WatchGuard {
    /// Reports that the guarded call returned. Yields the terminal state:
    /// `Satisfied` if no abort will ever be issued, `Fired` if the watcher
    /// already aborted the resource.
    pub fn complete(mut self) -> WatchState {
        self.finish()
    }

    #[inline]
    pub fn state(&self) -> WatchState {
        self.shared.state()
    }

    /// `true` once the resource has been aborted and should not be reused.
    #[inline]
    pub fn is_fired(&self) -> bool {
        self.state() == WatchState::Fired
    }

    fn finish(&mut self) -> WatchState {
        if !self.finished {
            self.finished = true;
            self.shared.claim(SATISFIED);
            self.shared.done.cancel();
        }
        self.shared.state()
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.finish();
    }
}
