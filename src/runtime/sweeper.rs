//! Background task driving [`LabBroker::tick`] on a fixed period.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::core::LabBroker;

/// Handle to a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Ask the loop to stop and wait for it to finish its current step.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "sweeper task ended abnormally");
        }
    }

    /// Whether the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the sweeper on the current tokio runtime.
///
/// Missed ticks are skipped rather than replayed in a burst; every step
/// reads the broker's own clock, so a late step simply sees more elapsed
/// time.
///
/// # Panics
/// Panics when called outside a tokio runtime.
pub fn spawn_sweeper(broker: Arc<LabBroker>, period: Duration) -> SweeperHandle {
    let (shutdown, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(period_ms = period.as_millis(), "sweeper started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    broker.tick();
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("sweeper stopped");
    });
    SweeperHandle { shutdown, task }
}
