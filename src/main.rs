use anyhow::Context;
use deadline_pool::{
    Config, Counters, DeadlineScope, Dispatcher, Executor, OperationError, WorkerPoolInner,
};
use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::Duration,
};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};


fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deadline_pool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid pool configuration")?;
    let rt = Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    rt.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let addr = spawn_slow_server(config.task_timeout).context("failed to start demo server")?;
    tracing::info!(%addr, workers = config.workers, timeout = ?config.task_timeout, grace = ?config.grace, "starting");

    // Stops the dispatcher and idle workers. In-flight calls answer only to
    // their deadline, so they get a token the shutdown signal never touches.
    let root = CancellationToken::new();
    let process = CancellationToken::new();
    let counters = Counters::new();
    let executor = Arc::new(Executor::from_config(counters.clone(), &config));
    let pool = WorkerPoolInner::with_config(root.clone(), &config)?;

    let monitor = counters.start_monitoring(Duration::from_secs(1), |snap, rate| {
        tracing::info!(
            total = snap.total,
            failed = snap.failed,
            deadline_failed = snap.deadline_failed,
            rps = rate.per_second(),
            deadline_ratio = snap.deadline_failure_ratio().unwrap_or(0.0),
            "counters"
        );
    });

    let stopper = root.clone();
    tokio::spawn(async move {
        if let Err(err) = wait_for_shutdown_signal().await {
            tracing::error!(error = %err, "signal registration failed");
        }
        tracing::info!("shutdown requested");
        stopper.cancel();
    });

    let timeout = config.task_timeout;
    let submitted = Dispatcher::new(pool.clone())
        .run(|_| {
            let executor = executor.clone();
            let process = process.clone();
            async move {
                let _ = executor
                    .run_with_deadline(&process, timeout, move |scope| request(addr, scope))
                    .await;
            }
        })
        .await;

    tracing::info!(workers = pool.workers(), "draining in-flight tasks");
    let drain = config.task_timeout.saturating_add(config.grace).saturating_add(config.settle);
    if !pool.closed_timeout(drain).await {
        tracing::warn!("workers did not stop in time");
    }
    monitor.cancel();

    let snap = counters.snapshot();
    tracing::info!(submitted, total = snap.total, failed = snap.failed, deadline_failed = snap.deadline_failed, "stopped");
    Ok(())
}

/// One request/response round trip, guarded against a server that stalls.
fn request(addr: SocketAddr, scope: &DeadlineScope) -> Result<u8, OperationError> {
    let stream = Arc::new(TcpStream::connect_timeout(&addr, scope.remaining())?);
    scope.check()?;

    let guard = scope.watch(stream.clone());
    (&*stream).write_all(b"?")?;
    let mut reply = [0u8; 1];
    let read = (&*stream).read_exact(&mut reply);
    guard.complete();
    read?;
    Ok(reply[0])
}

/// Answers every byte after a random delay of up to 1.5x the task timeout.
fn spawn_slow_server(timeout: Duration) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let max_delay = (timeout.as_millis() as u64 * 3 / 2).max(1);

    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { continue };
            thread::spawn(move || {
                let mut byte = [0u8; 1];
                while conn.read_exact(&mut byte).is_ok() {
                    thread::sleep(Duration::from_millis(rand::random::<u64>() % max_delay));
                    if conn.write_all(&byte).is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok(addr)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
