// Background janitor: runs `SessionCoordinator::sweep` on a fixed interval.
//
// Sweeps are idempotent and the database arbitrates between instances, so
// every collabd process can run its own janitor against the shared file.

use std::sync::Arc;
use std::time::Duration;

use studio_collab_engine::SessionCoordinator;
use tokio::sync::watch;
use tracing::{debug, error, warn};

pub fn start_janitor(coordinator: Arc<SessionCoordinator>, interval: Duration) -> JanitorHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(janitor_loop(coordinator, interval, shutdown_rx));
    JanitorHandle { task, shutdown_tx }
}

/// Handle for the janitor task. Dropping it also stops the loop, without
/// waiting for it.
pub struct JanitorHandle {
    task: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl JanitorHandle {
    /// Stop the loop and wait for an in-flight sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(join_error) = self.task.await {
            error!(?join_error, "janitor task failed");
        }
    }
}

async fn janitor_loop(
    coordinator: Arc<SessionCoordinator>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown_rx.changed() => {
                debug!("janitor shutting down");
                break;
            }
        }

        let coordinator = Arc::clone(&coordinator);
        match tokio::task::spawn_blocking(move || coordinator.sweep()).await {
            Ok(Ok(_report)) => {}
            Ok(Err(sweep_error)) => warn!(error = %sweep_error, "sweep failed; retrying next tick"),
            Err(join_error) => error!(?join_error, "sweep panicked"),
        }
    }
}
