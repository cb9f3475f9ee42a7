use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::Coordinator;

/// Worker pool handle.
/// - `request_shutdown()` で新しい lease の取得を止める（実行中の試行はそのまま終わる）
/// - `shutdown_and_join()` で全ワーカーと housekeeping の終了を待てる
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` stage workers plus one housekeeping task.
    pub fn spawn(n: usize, coordinator: Arc<Coordinator>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n + 1);
        for worker_id in 0..n {
            let coordinator = Arc::clone(&coordinator);
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, coordinator, &mut rx).await;
            }));
        }

        let interval = Duration::from_millis(coordinator.config().housekeeping_interval_ms);
        let mut rx = shutdown_rx;
        joins.push(tokio::spawn(async move {
            housekeeping_loop(coordinator, interval, &mut rx).await;
        }));

        info!(workers = n, "worker pool started");
        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    coordinator: Arc<Coordinator>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // lease は待つので shutdown と競合させる
        let lease = tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped == shutdown
                if changed.is_err() {
                    break;
                }
                continue;
            }
            lease = coordinator.lease() => lease,
        };

        debug!(worker_id, job_id = %lease.job_id, stage = %lease.stage, attempt = lease.attempt, "lease acquired");
        coordinator.run_lease(lease).await;
    }
    debug!(worker_id, "worker stopped");
}

async fn housekeeping_loop(
    coordinator: Arc<Coordinator>,
    interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(err) = coordinator.archive_expired().await {
            error!(error = %err, "retention sweep failed");
        }
    }
}
