use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::manager::manager::NetworkManager;

/// Running periodic maintenance. Dropping the handle also stops the task.
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    cycles: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Completed cycles so far
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop after the cycle in progress, if any, and wait for the task to end.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

pub(crate) fn spawn(manager: Arc<NetworkManager>, period: Duration) -> MaintenanceHandle {
    let (shutdown, mut stopped) = watch::channel(false);
    let cycles = Arc::new(AtomicU64::new(0));
    let completed = cycles.clone();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the first cycle runs one period in.
        interval.tick().await;

        info!(?period, "Maintenance started");
        loop {
            tokio::select! {
                _ = stopped.changed() => break,
                _ = interval.tick() => {
                    match manager.run_maintenance().await {
                        Ok(report) => info!(
                            peers = report.stats.peer_count,
                            evicted = report.evicted.len(),
                            under_replicated = report.under_replicated,
                            healed = report.healed,
                            unhealed = report.unhealed,
                            "Maintenance cycle finished"
                        ),
                        Err(e) => warn!(error = %e, "Maintenance cycle failed"),
                    }
                    completed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        info!("Maintenance stopped");
    });

    MaintenanceHandle {
        shutdown,
        cycles,
        task,
    }
}
