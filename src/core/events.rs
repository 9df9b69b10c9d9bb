//! Push-style events for connected clients and external collaborators.
//!
//! [`EventBus`] fans every [`LabEvent`] out over a `tokio::sync::broadcast`
//! channel. Publishing never blocks; with no subscribers the event is dropped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::model::{CompilationStatus, EndReason, LabStatus};
use crate::util::{CompilationId, LabId, SessionId, UserId};

/// Reward owed to a user by the gamification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardEvent {
    /// User to credit.
    pub user_id: UserId,
    /// Lab the session ran on.
    pub lab_id: LabId,
    /// Session that earned the reward.
    pub session_id: SessionId,
    /// Experience points.
    pub xp: u32,
    /// Served duration in seconds.
    pub duration_seconds: u64,
    /// How the session ended.
    pub reason: EndReason,
}

/// Event emitted by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LabEvent {
    /// A waiting user's position or estimate changed.
    QueueUpdated {
        /// Lab waited for.
        lab_id: LabId,
        /// Waiting user.
        user_id: UserId,
        /// New position.
        position: u32,
        /// New estimated wait.
        estimated_wait_secs: u64,
    },
    /// A waiting user's entry lapsed and was removed.
    QueueExpired {
        /// Lab waited for.
        lab_id: LabId,
        /// Evicted user.
        user_id: UserId,
    },
    /// A session acquired a lab.
    SessionStarted {
        /// New session.
        session_id: SessionId,
        /// Lab acquired.
        lab_id: LabId,
        /// Session owner.
        user_id: UserId,
        /// Whether the session came from queue promotion.
        promoted: bool,
    },
    /// A session crossed a remaining-time threshold.
    SessionWarning {
        /// Session running out.
        session_id: SessionId,
        /// Lab in use.
        lab_id: LabId,
        /// Session owner.
        user_id: UserId,
        /// Seconds left.
        remaining_secs: u64,
        /// Threshold that was crossed.
        threshold_secs: u64,
    },
    /// A session ended.
    SessionEnded {
        /// Ended session.
        session_id: SessionId,
        /// Lab released.
        lab_id: LabId,
        /// Session owner.
        user_id: UserId,
        /// Why it ended.
        reason: EndReason,
        /// Served duration in seconds.
        duration_seconds: u64,
        /// Experience points awarded.
        xp_earned: u32,
    },
    /// Live telemetry for the session bound to a lab.
    SensorData {
        /// Lab reporting.
        lab_id: LabId,
        /// Session the data belongs to.
        session_id: SessionId,
        /// Readings.
        sensors: BTreeMap<String, serde_json::Value>,
        /// Agent timestamp (ms since epoch).
        timestamp: u64,
    },
    /// A compilation job changed state.
    CompilationStatusChanged {
        /// Job.
        compilation_id: CompilationId,
        /// Session the job belongs to.
        session_id: SessionId,
        /// New status.
        status: CompilationStatus,
    },
    /// A lab's availability or connectivity changed.
    LabStatusChanged {
        /// Lab.
        lab_id: LabId,
        /// Availability.
        status: LabStatus,
        /// Connectivity.
        is_online: bool,
    },
    /// Reward for the gamification collaborator.
    RewardEarned(RewardEvent),
    /// User-facing notification for the notification collaborator.
    Notification {
        /// Recipient.
        user_id: UserId,
        /// Short title.
        title: String,
        /// Body text.
        body: String,
    },
}

impl LabEvent {
    /// User the event is addressed to, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::QueueUpdated { user_id, .. }
            | Self::QueueExpired { user_id, .. }
            | Self::SessionStarted { user_id, .. }
            | Self::SessionWarning { user_id, .. }
            | Self::SessionEnded { user_id, .. }
            | Self::Notification { user_id, .. } => Some(user_id),
            Self::RewardEarned(reward) => Some(&reward.user_id),
            Self::SensorData { .. }
            | Self::CompilationStatusChanged { .. }
            | Self::LabStatusChanged { .. } => None,
        }
    }
}

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LabEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// Slow receivers observe `RecvError::Lagged` once the buffer wraps.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: LabEvent) {
        // A send error only means there are no receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LabEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Drain every event currently buffered on `rx` without waiting.
pub fn drain(rx: &mut broadcast::Receiver<LabEvent>) -> Vec<LabEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(LabEvent::QueueExpired {
            lab_id: "lab-1".into(),
            user_id: "u1".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_drain_collects_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        for user in ["a", "b"] {
            bus.publish(LabEvent::QueueExpired {
                lab_id: "lab-1".into(),
                user_id: user.into(),
            });
        }
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].user_id(), Some("b"));
    }
}
