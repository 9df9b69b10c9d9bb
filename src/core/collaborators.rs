//! Delivery of broker events to external collaborators.
//!
//! Rewards and notifications are owned by other systems; the broker only
//! emits [`LabEvent`]s. [`forward_events`] subscribes to the bus and hands
//! the relevant ones to async sinks on a background task.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;

use crate::core::error::AppResult;
use crate::core::events::{EventBus, LabEvent, RewardEvent};

/// Abstraction over the runtime used to run background work.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Gamification collaborator receiving XP awards.
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use lab_broker::core::{RewardEvent, RewardSink};
///
/// struct Ledger;
///
/// #[async_trait]
/// impl RewardSink for Ledger {
///     async fn award(&self, reward: RewardEvent) -> anyhow::Result<()> {
///         println!("{} earned {} XP", reward.user_id, reward.xp);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait RewardSink: Send + Sync + 'static {
    /// Credit a reward.
    async fn award(&self, reward: RewardEvent) -> AppResult<()>;
}

/// Notification collaborator.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    /// Deliver a notification to a user.
    async fn notify(&self, user_id: &str, title: &str, body: &str) -> AppResult<()>;
}

/// Sink that only writes to the log; used when no collaborator is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

#[async_trait]
impl RewardSink for LoggingSink {
    async fn award(&self, reward: RewardEvent) -> AppResult<()> {
        tracing::info!(user_id = %reward.user_id, xp = reward.xp, session_id = %reward.session_id, "reward earned");
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn notify(&self, user_id: &str, title: &str, _body: &str) -> AppResult<()> {
        tracing::info!(user_id, title, "notification");
        Ok(())
    }
}

/// Forward reward and notification events to their sinks until the bus
/// closes. Sink failures are logged and never stop the forwarder.
pub fn forward_events<S: Spawn>(
    bus: &EventBus,
    rewards: Arc<dyn RewardSink>,
    notifications: Arc<dyn NotificationSink>,
    spawner: &S,
) {
    let mut rx = bus.subscribe();
    spawner.spawn(async move {
        loop {
            match rx.recv().await {
                Ok(LabEvent::RewardEarned(reward)) => {
                    let user_id = reward.user_id.clone();
                    if let Err(e) = rewards.award(reward).await {
                        tracing::error!(user_id = %user_id, error = %e, "reward delivery failed");
                    }
                }
                Ok(LabEvent::Notification {
                    user_id,
                    title,
                    body,
                }) => {
                    if let Err(e) = notifications.notify(&user_id, &title, &body).await {
                        tracing::error!(user_id = %user_id, error = %e, "notification delivery failed");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event forwarder lagged, events skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("event forwarder stopped");
    });
}
