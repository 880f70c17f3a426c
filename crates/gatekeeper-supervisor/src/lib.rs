//! # Gatekeeper Supervisor
//!
//! Starts one task per registered worker, polls liveness every 30 seconds,
//! restarts anything found dead, and drives orderly shutdown on a
//! termination signal: ask every worker to stop via its cancellation
//! token, wait a grace period, then abort whatever is still running.
//!
//! Workers are registered as factories (`Fn(CancellationToken) -> Future`)
//! rather than pre-built futures, since a restarted worker needs a fresh
//! future built from a fresh child token — the original future, once
//! polled to completion or cancelled, cannot be reused.

use futures::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

type WorkerFactory = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send>;

struct ManagedWorker {
    name: &'static str,
    factory: WorkerFactory,
    handle: Option<JoinHandle<()>>,
}

/// Owns the lifecycle of a fixed set of long-running workers for one gate
/// process (in practice: fetch, push, cleanup).
pub struct Supervisor {
    shutdown: CancellationToken,
    workers: Vec<ManagedWorker>,
    health_poll_interval: Duration,
    shutdown_grace_period: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Supervisor::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor::with_intervals(HEALTH_POLL_INTERVAL, SHUTDOWN_GRACE_PERIOD)
    }

    /// Builds a supervisor with non-default cadences, for tests that
    /// cannot wait out the production 30-second health poll.
    pub fn with_intervals(health_poll_interval: Duration, shutdown_grace_period: Duration) -> Self {
        Supervisor {
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
            health_poll_interval,
            shutdown_grace_period,
        }
    }

    /// Registers a worker under `name`. `factory` is called once at
    /// startup and again every time the worker is found dead; it must
    /// build a fresh future each time from the `CancellationToken` it is given.
    pub fn register<F, Fut>(&mut self, name: &'static str, factory: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: WorkerFactory = Box::new(move |token| Box::pin(factory(token)));
        self.workers.push(ManagedWorker {
            name,
            factory: boxed,
            handle: None,
        });
    }

    /// A token that, once cancelled, signals every worker to stop. Useful
    /// for wiring an external shutdown source in addition to the signal
    /// handler this type installs on its own.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn spawn(worker: &mut ManagedWorker, parent: &CancellationToken) {
        let child = parent.child_token();
        let future = (worker.factory)(child);
        worker.handle = Some(tokio::spawn(future));
    }

    /// Runs until a termination signal arrives or `shutdown_token` is
    /// cancelled externally. Blocks for the duration of the process's
    /// worker lifetime; returns only after every worker has stopped or
    /// been aborted.
    pub async fn run(&mut self) {
        for worker in &mut self.workers {
            tracing::info!(worker = worker.name, "starting worker");
            Self::spawn(worker, &self.shutdown);
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.health_poll_interval) => {
                    self.restart_dead_workers();
                }
                () = wait_for_termination_signal() => {
                    tracing::info!("termination signal received, shutting down");
                    self.shutdown.cancel();
                    break;
                }
                () = self.shutdown.cancelled() => {
                    break;
                }
            }
        }

        self.drain().await;
    }

    fn restart_dead_workers(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        for worker in &mut self.workers {
            let dead = worker
                .handle
                .as_ref()
                .map(|h| h.is_finished())
                .unwrap_or(true);
            if dead {
                tracing::warn!(worker = worker.name, "worker found dead, restarting");
                Self::spawn(worker, &self.shutdown);
            }
        }
    }

    async fn drain(&mut self) {
        self.shutdown.cancel();
        for worker in &mut self.workers {
            let Some(mut handle) = worker.handle.take() else {
                continue;
            };
            tokio::select! {
                result = &mut handle => {
                    match result {
                        Ok(()) => tracing::info!(worker = worker.name, "stopped cleanly"),
                        Err(err) => tracing::error!(worker = worker.name, error = %err, "worker task panicked"),
                    }
                }
                _ = tokio::time::sleep(self.shutdown_grace_period) => {
                    tracing::warn!(worker = worker.name, "did not stop within grace period, aborting");
                    handle.abort();
                }
            }
        }
    }
}

async fn wait_for_termination_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
