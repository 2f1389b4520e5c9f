//! Ordered shutdown of background workers.
//!
//! WAL archivers, the retention scheduler and any in-flight restore bookkeeping are backend
//! workers: each one [`register`][ShutdownManager::register]s for a [`ShutdownToken`], stops taking
//! new work once [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown] resolves and then calls
//! [`complete`][ShutdownToken::complete]. Only when every registered worker has completed is the
//! frontend token (the admin HTTP server) cancelled, so no request can observe a half-stopped
//! backend.
use std::sync::Arc;
use std::time::Duration;

use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut term, mut int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!(%e, "failed to register signal handlers, only ctrl+c will stop the process");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
}

/// Wait for a `ctrl+c` to stop the process on Windows systems
#[cfg(windows)]
pub async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received SIGINT");
}

#[derive(Debug)]
pub struct ShutdownManager {
    frontend_shutdown: CancellationToken,
    backend_shutdown: CancellationToken,
    workers: TaskTracker,
    pending: Arc<Mutex<Vec<&'static str>>>,
}

impl ShutdownManager {
    /// `frontend_shutdown` is cancelled once every backend worker has completed
    pub fn new(frontend_shutdown: CancellationToken) -> Self {
        Self {
            frontend_shutdown,
            backend_shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
            pending: Default::default(),
        }
    }

    pub fn new_testing() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Register a backend worker named `component`.
    ///
    /// The worker must call [`complete`][ShutdownToken::complete] on the returned token, or drop
    /// every clone of it, before shutdown can finish.
    pub fn register(&self, component: &'static str) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push(component);
        let pending = Arc::clone(&self.pending);
        self.workers.spawn(async move {
            let _ = rx.await;
            let mut pending = pending.lock();
            if let Some(pos) = pending.iter().position(|c| *c == component) {
                pending.swap_remove(pos);
            }
        });
        ShutdownToken {
            component,
            token: self.backend_shutdown.clone(),
            complete_tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Signal every registered worker to stop
    pub fn shutdown(&self) {
        info!(workers = self.workers.len(), "shutting down background workers");
        self.backend_shutdown.cancel();
    }

    /// Wait for every registered worker to complete, then cancel the frontend
    pub async fn join(&self) {
        self.workers.close();
        self.workers.wait().await;
        info!("background workers stopped");
        self.frontend_shutdown.cancel();
    }

    /// Like [`join`][Self::join], but gives up waiting after `timeout`. The frontend is cancelled
    /// either way. Returns `false` if some workers had not completed.
    pub async fn join_with_timeout(&self, timeout: Duration) -> bool {
        let done = tokio::time::timeout(timeout, async {
            self.workers.close();
            self.workers.wait().await;
        })
        .await
        .is_ok();
        if !done {
            warn!(
                pending = ?self.pending.lock().as_slice(),
                ?timeout,
                "background workers did not stop in time"
            );
        }
        self.frontend_shutdown.cancel();
        done
    }

    /// Components that have not completed yet
    pub fn pending(&self) -> Vec<&'static str> {
        let mut pending = self.pending.lock().clone();
        pending.sort_unstable();
        pending
    }
}

/// Handed to a backend worker by [`ShutdownManager::register`]. Clones share completion.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    component: &'static str,
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    pub fn component(&self) -> &'static str {
        self.component
    }

    /// Shut the whole process down from inside a worker
    pub fn trigger_shutdown(&self) {
        warn!(component = self.component, "shutdown triggered by worker");
        self.token.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Tell the manager this worker has finished cleaning up
    pub fn complete(&self) {
        if let Some(tx) = self.complete_tx.lock().take() {
            info!(component = self.component, "worker stopped");
            let _ = tx.send(());
        }
    }
}
