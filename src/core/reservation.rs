//! Per-lab waiting lists with bid-weighted ordering.
//!
//! Ordering: higher bid first, then earlier join time, then join sequence.
//! Positions are re-densified (1, 2, 3, …) after every mutation and each
//! change is written through to the store as a full snapshot.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::events::{EventBus, LabEvent};
use crate::core::model::LabQueueEntry;
use crate::core::registry::LabRegistry;
use crate::core::{LabError, LabStore};
use crate::util::{duration_ms, LabId, SharedClock, UserId};

/// Policy turning queue position and lab history into a wait estimate.
pub trait WaitPolicy: Send + Sync {
    /// How many recent finished sessions to feed into [`estimate`](Self::estimate).
    fn history_window(&self) -> usize;
    /// Estimated wait for an entrant at `position` given recent session
    /// durations in seconds, newest first.
    fn estimate(&self, position: u32, history_secs: &[u64]) -> Duration;
}

/// Mean recent session length times position.
///
/// Position counts the current occupant, so the first waiter is expected
/// to wait one average session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AverageSessionPolicy {
    /// Number of recent sessions averaged.
    pub history_window: usize,
    /// Session length assumed when the lab has no history.
    pub fallback_session: Duration,
}

impl WaitPolicy for AverageSessionPolicy {
    fn history_window(&self) -> usize {
        self.history_window
    }

    fn estimate(&self, position: u32, history_secs: &[u64]) -> Duration {
        let average = if history_secs.is_empty() {
            self.fallback_session.as_secs()
        } else {
            history_secs.iter().sum::<u64>() / history_secs.len() as u64
        };
        Duration::from_secs(average.saturating_mul(u64::from(position)))
    }
}

/// A user's standing in a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTicket {
    /// Lab waited for.
    pub lab_id: LabId,
    /// Waiting user.
    pub user_id: UserId,
    /// Dense 1-based position.
    pub position: u32,
    /// Estimated wait in seconds.
    pub estimated_wait_secs: u64,
    /// Time the entry lapses (ms since epoch).
    pub expires_at_ms: u128,
}

/// Admission limits for queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLimits {
    /// Lifetime of an entry from join.
    pub entry_ttl: Duration,
    /// Largest accepted bid.
    pub max_bid: i64,
    /// Largest number of waiters per lab.
    pub max_depth: usize,
}

fn rank(a: &LabQueueEntry, b: &LabQueueEntry) -> CmpOrdering {
    b.bid_amount
        .cmp(&a.bid_amount)
        .then(a.joined_at_ms.cmp(&b.joined_at_ms))
        .then(a.sequence.cmp(&b.sequence))
}

fn densify(entries: &mut [LabQueueEntry]) {
    for (idx, entry) in entries.iter_mut().enumerate() {
        entry.position = u32::try_from(idx + 1).unwrap_or(u32::MAX);
    }
}

/// Live waiting lists for all labs.
pub struct ReservationQueue {
    queues: RwLock<HashMap<LabId, Arc<Mutex<Vec<LabQueueEntry>>>>>,
    limits: QueueLimits,
    policy: Arc<dyn WaitPolicy>,
    registry: Arc<LabRegistry>,
    store: Arc<dyn LabStore>,
    clock: SharedClock,
    events: EventBus,
    sequence: AtomicU64,
}

impl ReservationQueue {
    /// Create empty queues.
    pub fn new(
        limits: QueueLimits,
        policy: Arc<dyn WaitPolicy>,
        registry: Arc<LabRegistry>,
        store: Arc<dyn LabStore>,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            limits,
            policy,
            registry,
            store,
            clock,
            events,
            sequence: AtomicU64::new(0),
        }
    }

    fn list(&self, lab_id: &str) -> Arc<Mutex<Vec<LabQueueEntry>>> {
        if let Some(list) = self.queues.read().get(lab_id) {
            return Arc::clone(list);
        }
        Arc::clone(self.queues.write().entry(lab_id.to_string()).or_default())
    }

    /// Reload a lab's queue from the store snapshot. Returns the entry count.
    ///
    /// # Errors
    /// [`LabError::Storage`] if the snapshot cannot be read.
    pub fn restore(&self, lab_id: &str) -> Result<usize, LabError> {
        let mut entries = self.store.load_queue(lab_id)?;
        entries.sort_by(rank);
        densify(&mut entries);
        let max_seq = entries.iter().map(|e| e.sequence).max().unwrap_or(0);
        self.sequence.fetch_max(max_seq + 1, Ordering::AcqRel);
        let count = entries.len();
        *self.list(lab_id).lock() = entries;
        self.mirror_count(lab_id, count);
        Ok(count)
    }

    fn history(&self, lab_id: &str) -> Vec<u64> {
        self.store
            .recent_session_durations(lab_id, self.policy.history_window())
            .unwrap_or_else(|e| {
                tracing::warn!(lab_id, error = %e, "session history unavailable, using fallback");
                Vec::new()
            })
    }

    fn ticket(&self, entry: &LabQueueEntry, history: &[u64]) -> QueueTicket {
        QueueTicket {
            lab_id: entry.lab_id.clone(),
            user_id: entry.user_id.clone(),
            position: entry.position,
            estimated_wait_secs: self.policy.estimate(entry.position, history).as_secs(),
            expires_at_ms: entry.expires_at_ms,
        }
    }

    fn mirror_count(&self, lab_id: &str, count: usize) {
        if let Err(e) = self.registry.set_queue_count(lab_id, count) {
            tracing::warn!(lab_id, error = %e, "failed to mirror queue depth");
        }
    }

    /// Write `next` through to the store, announce moved entrants, and
    /// commit it as the live list.
    fn commit(
        &self,
        lab_id: &str,
        slot: &mut Vec<LabQueueEntry>,
        next: Vec<LabQueueEntry>,
    ) -> Result<(), LabError> {
        self.store.save_queue(lab_id, &next)?;
        let before: HashMap<&str, u32> = slot
            .iter()
            .map(|e| (e.user_id.as_str(), e.position))
            .collect();
        let history = self.history(lab_id);
        for entry in &next {
            if before.get(entry.user_id.as_str()) != Some(&entry.position) {
                let ticket = self.ticket(entry, &history);
                self.events.publish(LabEvent::QueueUpdated {
                    lab_id: ticket.lab_id,
                    user_id: ticket.user_id,
                    position: ticket.position,
                    estimated_wait_secs: ticket.estimated_wait_secs,
                });
            }
        }
        let count = next.len();
        *slot = next;
        self.mirror_count(lab_id, count);
        Ok(())
    }

    fn announce_expired(&self, expired: &[LabQueueEntry]) {
        for entry in expired {
            tracing::info!(lab_id = %entry.lab_id, user_id = %entry.user_id, "queue entry expired");
            self.events.publish(LabEvent::QueueExpired {
                lab_id: entry.lab_id.clone(),
                user_id: entry.user_id.clone(),
            });
        }
    }

    /// Join a lab's queue with a bid.
    ///
    /// A user whose previous entry lapsed but was not yet swept may rejoin.
    ///
    /// # Errors
    /// [`LabError::InvalidBid`], [`LabError::AlreadyQueued`],
    /// [`LabError::QueueFull`], [`LabError::LabNotFound`] or
    /// [`LabError::Storage`].
    pub fn join(&self, lab_id: &str, user_id: &str, bid_amount: i64) -> Result<QueueTicket, LabError> {
        if bid_amount < 0 || bid_amount > self.limits.max_bid {
            return Err(LabError::InvalidBid(bid_amount));
        }
        self.registry.get(lab_id)?;

        let now = self.clock.now_ms();
        let list = self.list(lab_id);
        let mut entries = list.lock();
        let mut next = entries.clone();
        let mut lapsed = Vec::new();
        if let Some(idx) = next.iter().position(|e| e.user_id == user_id) {
            if !next[idx].is_expired(now) {
                return Err(LabError::AlreadyQueued(lab_id.to_string()));
            }
            lapsed.push(next.remove(idx));
        }
        if next.len() >= self.limits.max_depth {
            return Err(LabError::QueueFull(lab_id.to_string()));
        }

        let entry = LabQueueEntry {
            lab_id: lab_id.to_string(),
            user_id: user_id.to_string(),
            position: 0,
            bid_amount,
            joined_at_ms: now,
            expires_at_ms: now + duration_ms(self.limits.entry_ttl),
            sequence: self.sequence.fetch_add(1, Ordering::AcqRel),
        };
        let at = next.partition_point(|e| rank(e, &entry) == CmpOrdering::Less);
        next.insert(at, entry);
        densify(&mut next);

        self.commit(lab_id, &mut entries, next)?;
        self.announce_expired(&lapsed);
        let history = self.history(lab_id);
        let ticket = self.ticket(&entries[at], &history);
        tracing::info!(lab_id, user_id, position = ticket.position, bid_amount, "joined queue");
        Ok(ticket)
    }

    /// Leave a lab's queue.
    ///
    /// # Errors
    /// [`LabError::NotQueued`] or [`LabError::Storage`].
    pub fn leave(&self, lab_id: &str, user_id: &str) -> Result<(), LabError> {
        let list = self.list(lab_id);
        let mut entries = list.lock();
        let idx = entries
            .iter()
            .position(|e| e.user_id == user_id)
            .ok_or_else(|| LabError::NotQueued(lab_id.to_string()))?;
        let mut next = entries.clone();
        next.remove(idx);
        densify(&mut next);
        self.commit(lab_id, &mut entries, next)?;
        tracing::info!(lab_id, user_id, "left queue");
        Ok(())
    }

    /// Remove entries past their expiry. Returns the evicted entries.
    ///
    /// # Errors
    /// [`LabError::Storage`].
    pub fn expire_stale(&self, lab_id: &str) -> Result<Vec<LabQueueEntry>, LabError> {
        let now = self.clock.now_ms();
        let list = self.list(lab_id);
        let mut entries = list.lock();
        if !entries.iter().any(|e| e.is_expired(now)) {
            return Ok(Vec::new());
        }
        let (expired, mut next): (Vec<_>, Vec<_>) =
            entries.iter().cloned().partition(|e| e.is_expired(now));
        densify(&mut next);
        self.commit(lab_id, &mut entries, next)?;
        self.announce_expired(&expired);
        Ok(expired)
    }

    /// Pop the highest-ranked live entry, discarding lapsed ones ahead of it.
    ///
    /// # Errors
    /// [`LabError::Storage`].
    pub fn promote_next(&self, lab_id: &str) -> Result<Option<LabQueueEntry>, LabError> {
        let now = self.clock.now_ms();
        let list = self.list(lab_id);
        let mut entries = list.lock();
        if entries.is_empty() {
            return Ok(None);
        }
        let mut next = entries.clone();
        let mut lapsed = Vec::new();
        let mut promoted = None;
        while !next.is_empty() {
            let head = next.remove(0);
            if head.is_expired(now) {
                lapsed.push(head);
            } else {
                promoted = Some(head);
                break;
            }
        }
        densify(&mut next);
        self.commit(lab_id, &mut entries, next)?;
        self.announce_expired(&lapsed);
        if let Some(entry) = &promoted {
            tracing::info!(lab_id, user_id = %entry.user_id, bid = entry.bid_amount, "promoted from queue");
        }
        Ok(promoted)
    }

    /// Put a promoted entry back at its rank after the hand-over failed.
    ///
    /// The live list is restored even if the store rejects the write.
    pub fn reinstate(&self, entry: LabQueueEntry) {
        let lab_id = entry.lab_id.clone();
        let user_id = entry.user_id.clone();
        let list = self.list(&lab_id);
        let mut entries = list.lock();
        if entries.iter().any(|e| e.user_id == user_id) {
            return;
        }
        let mut next = entries.clone();
        let at = next.partition_point(|e| rank(e, &entry) == CmpOrdering::Less);
        next.insert(at, entry);
        densify(&mut next);
        if let Err(e) = self.commit(&lab_id, &mut entries, next.clone()) {
            tracing::error!(lab_id = %lab_id, user_id = %user_id, error = %e, "reinstated entry not persisted");
            let count = next.len();
            *entries = next;
            self.mirror_count(&lab_id, count);
        }
        tracing::info!(lab_id = %lab_id, user_id = %user_id, position = at + 1, "queue entry reinstated");
    }

    /// Current standing of a user.
    ///
    /// # Errors
    /// [`LabError::NotQueued`], or [`LabError::QueueEntryExpired`] if the
    /// entry lapsed and awaits the sweep.
    pub fn position_of(&self, lab_id: &str, user_id: &str) -> Result<QueueTicket, LabError> {
        let now = self.clock.now_ms();
        let list = self.list(lab_id);
        let entries = list.lock();
        let entry = entries
            .iter()
            .find(|e| e.user_id == user_id)
            .ok_or_else(|| LabError::NotQueued(lab_id.to_string()))?;
        if entry.is_expired(now) {
            return Err(LabError::QueueEntryExpired(lab_id.to_string()));
        }
        let history = self.history(lab_id);
        Ok(self.ticket(entry, &history))
    }

    /// Snapshot of a lab's queue in rank order.
    #[must_use]
    pub fn entries(&self, lab_id: &str) -> Vec<LabQueueEntry> {
        self.list(lab_id).lock().clone()
    }

    /// Number of waiters for a lab, lapsed ones included until swept.
    #[must_use]
    pub fn len(&self, lab_id: &str) -> usize {
        self.list(lab_id).lock().len()
    }

    /// Whether nobody waits for the lab.
    #[must_use]
    pub fn is_empty(&self, lab_id: &str) -> bool {
        self.len(lab_id) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Lab;
    use crate::infra::InMemoryLabStore;
    use crate::util::ManualClock;

    fn queue(clock: Arc<ManualClock>) -> ReservationQueue {
        let store: Arc<dyn LabStore> = Arc::new(InMemoryLabStore::new());
        let events = EventBus::default();
        let registry = Arc::new(LabRegistry::new(
            Arc::clone(&store),
            clock.clone(),
            events.clone(),
            Duration::from_secs(30),
            3,
        ));
        registry
            .register(Lab::new("lab-1", "Rig", Duration::from_secs(600)))
            .unwrap();
        ReservationQueue::new(
            QueueLimits {
                entry_ttl: Duration::from_secs(300),
                max_bid: 100,
                max_depth: 3,
            },
            Arc::new(AverageSessionPolicy {
                history_window: 5,
                fallback_session: Duration::from_secs(600),
            }),
            registry,
            store,
            clock,
            events,
        )
    }

    fn order(q: &ReservationQueue) -> Vec<(String, u32)> {
        q.entries("lab-1")
            .into_iter()
            .map(|e| (e.user_id, e.position))
            .collect()
    }

    #[test]
    fn test_bid_then_fifo_ordering() {
        let q = queue(Arc::new(ManualClock::new(0)));
        q.join("lab-1", "a", 10).unwrap();
        q.join("lab-1", "b", 10).unwrap();
        q.join("lab-1", "c", 5).unwrap();
        q.leave("lab-1", "c").unwrap();
        q.join("lab-1", "d", 50).unwrap();

        assert_eq!(
            order(&q),
            vec![("d".into(), 1), ("a".into(), 2), ("b".into(), 3)]
        );
    }

    #[test]
    fn test_rejects_duplicates_bad_bids_and_overflow() {
        let q = queue(Arc::new(ManualClock::new(0)));
        q.join("lab-1", "a", 0).unwrap();
        assert_eq!(
            q.join("lab-1", "a", 3).unwrap_err(),
            LabError::AlreadyQueued("lab-1".into())
        );
        assert_eq!(q.join("lab-1", "b", -1).unwrap_err(), LabError::InvalidBid(-1));
        assert_eq!(q.join("lab-1", "b", 101).unwrap_err(), LabError::InvalidBid(101));
        q.join("lab-1", "b", 1).unwrap();
        q.join("lab-1", "c", 1).unwrap();
        assert_eq!(
            q.join("lab-1", "d", 1).unwrap_err(),
            LabError::QueueFull("lab-1".into())
        );
    }

    #[test]
    fn test_leave_densifies_and_shrinks_estimates() {
        let q = queue(Arc::new(ManualClock::new(0)));
        q.join("lab-1", "a", 0).unwrap();
        q.join("lab-1", "b", 0).unwrap();
        let before = q.position_of("lab-1", "b").unwrap();
        assert_eq!(before.position, 2);
        assert_eq!(before.estimated_wait_secs, 1200);

        q.leave("lab-1", "a").unwrap();
        let after = q.position_of("lab-1", "b").unwrap();
        assert_eq!(after.position, 1);
        assert_eq!(after.estimated_wait_secs, 600);
        assert_eq!(
            q.leave("lab-1", "a").unwrap_err(),
            LabError::NotQueued("lab-1".into())
        );
    }

    #[test]
    fn test_promote_skips_lapsed_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let q = queue(Arc::clone(&clock));
        q.join("lab-1", "early", 99).unwrap();
        clock.advance(Duration::from_secs(200));
        q.join("lab-1", "late", 1).unwrap();
        clock.advance(Duration::from_secs(150));

        assert_eq!(
            q.position_of("lab-1", "early").unwrap_err(),
            LabError::QueueEntryExpired("lab-1".into())
        );
        let promoted = q.promote_next("lab-1").unwrap().unwrap();
        assert_eq!(promoted.user_id, "late");
        assert!(q.is_empty("lab-1"));
    }

    #[test]
    fn test_expire_stale_keeps_positions_dense() {
        let clock = Arc::new(ManualClock::new(0));
        let q = queue(Arc::clone(&clock));
        q.join("lab-1", "a", 0).unwrap();
        clock.advance(Duration::from_secs(100));
        q.join("lab-1", "b", 0).unwrap();
        q.join("lab-1", "c", 0).unwrap();
        clock.advance(Duration::from_secs(250));

        let expired = q.expire_stale("lab-1").unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(order(&q), vec![("b".into(), 1), ("c".into(), 2)]);
        assert!(q.expire_stale("lab-1").unwrap().is_empty());
    }

    #[test]
    fn test_average_policy_uses_history() {
        let policy = AverageSessionPolicy {
            history_window: 3,
            fallback_session: Duration::from_secs(900),
        };
        assert_eq!(policy.estimate(2, &[]), Duration::from_secs(1800));
        assert_eq!(policy.estimate(3, &[100, 200, 300]), Duration::from_secs(600));
    }
}
