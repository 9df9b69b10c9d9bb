//! Session lifecycle: `requested → active → {completed, expired, cancelled}`.
//!
//! The session manager is the only component that opens or closes sessions.
//! Every compound step (acquire, open channel, promote, release) runs on the
//! lab's lane, so at most one live session exists per lab. Terminal states
//! are final: the first `end` wins and later ones fail with
//! [`LabError::SessionAlreadyTerminal`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::booking::BookingLedger;
use crate::core::bridge::{ChannelDescriptor, HardwareBridge};
use crate::core::events::{EventBus, LabEvent, RewardEvent};
use crate::core::lanes::LabLanes;
use crate::core::model::{
    CompilationStatus, EndReason, HardwareConfig, HardwareEventKind, LabSession, SessionFeedback,
    SessionStatus,
};
use crate::core::registry::LabRegistry;
use crate::core::reservation::ReservationQueue;
use crate::core::{LabError, LabStore};
use crate::util::{duration_ms, new_id, LabId, SessionId, SharedClock, UserId};

/// Experience awarded when a session ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpPolicy {
    /// Points per started minute of served time.
    pub per_minute: u32,
    /// Bonus for sessions that ran to a normal end.
    pub completion_bonus: u32,
    /// Ceiling per session.
    pub max_xp: u32,
}

impl Default for XpPolicy {
    fn default() -> Self {
        Self {
            per_minute: 2,
            completion_bonus: 10,
            max_xp: 150,
        }
    }
}

impl XpPolicy {
    /// Points for `served_secs` of use ending with `reason`.
    ///
    /// Sessions that never served time earn nothing.
    #[must_use]
    pub fn award(&self, served_secs: u64, reason: EndReason) -> u32 {
        if served_secs == 0 {
            return 0;
        }
        let base = served_secs
            .div_ceil(60)
            .saturating_mul(u64::from(self.per_minute));
        let bonus = match reason {
            EndReason::UserRequested | EndReason::Expired => u64::from(self.completion_bonus),
            EndReason::HardwareOffline | EndReason::Cancelled => 0,
        };
        let total = base.saturating_add(bonus).min(u64::from(self.max_xp));
        u32::try_from(total).unwrap_or(self.max_xp)
    }
}

/// Session timing and reward settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Remaining-time thresholds (seconds) that trigger a warning.
    pub warning_thresholds_secs: Vec<u64>,
    /// Time a promoted user has to confirm; `None` activates immediately.
    pub confirm_grace: Option<Duration>,
    /// Reward calculation.
    pub xp: XpPolicy,
}

/// Everything a client needs to use a freshly opened session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Session identifier.
    pub session_id: SessionId,
    /// Acquired lab.
    pub lab_id: LabId,
    /// Session owner.
    pub user_id: UserId,
    /// `requested` until confirmed, then `active`.
    pub status: SessionStatus,
    /// Token scoping access to the session's channel.
    pub access_token: String,
    /// Topics bound to the session.
    pub channel: ChannelDescriptor,
    /// Rig description.
    pub hardware: HardwareConfig,
    /// Acquisition time (ms since epoch).
    pub started_at_ms: u128,
    /// Hard deadline (ms since epoch).
    pub expires_at_ms: u128,
    /// Confirmation deadline for promoted sessions.
    pub confirm_by_ms: Option<u128>,
}

/// Outcome of ending a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Ended session.
    pub session_id: SessionId,
    /// Lab released.
    pub lab_id: LabId,
    /// Terminal status.
    pub status: SessionStatus,
    /// Why it ended.
    pub reason: EndReason,
    /// Served duration in seconds.
    pub duration_seconds: u64,
    /// Experience points awarded.
    pub xp_earned: u32,
}

/// Counts from one deadline scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadlineReport {
    /// Warnings emitted.
    pub warnings: usize,
    /// Sessions expired.
    pub expired: usize,
    /// Promotions cancelled for lack of confirmation.
    pub unconfirmed: usize,
}

/// Outcome of one offline sweep over all labs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfflineSweep {
    /// Labs whose agent fell silent since the previous sweep.
    pub went_offline: usize,
    /// Labs moved to `offline` status.
    pub marked_offline: usize,
    /// Sessions force-ended with `hardware_offline`.
    pub force_ended: Vec<SessionSummary>,
}

/// Owner of the session state machine.
pub struct SessionManager {
    live: RwLock<HashMap<SessionId, Arc<Mutex<LabSession>>>>,
    by_lab: RwLock<HashMap<LabId, SessionId>>,
    registry: Arc<LabRegistry>,
    queue: Arc<ReservationQueue>,
    bridge: Arc<HardwareBridge>,
    bookings: Arc<BookingLedger>,
    lanes: Arc<LabLanes>,
    store: Arc<dyn LabStore>,
    clock: SharedClock,
    events: EventBus,
    policy: SessionPolicy,
}

impl SessionManager {
    /// Wire a session manager over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<LabRegistry>,
        queue: Arc<ReservationQueue>,
        bridge: Arc<HardwareBridge>,
        bookings: Arc<BookingLedger>,
        lanes: Arc<LabLanes>,
        store: Arc<dyn LabStore>,
        clock: SharedClock,
        events: EventBus,
        mut policy: SessionPolicy,
    ) -> Self {
        policy.warning_thresholds_secs.sort_unstable();
        policy.warning_thresholds_secs.dedup();
        Self {
            live: RwLock::new(HashMap::new()),
            by_lab: RwLock::new(HashMap::new()),
            registry,
            queue,
            bridge,
            bookings,
            lanes,
            store,
            clock,
            events,
            policy,
        }
    }

    /// Per-lab serialization shared with the broker.
    #[must_use]
    pub fn lanes(&self) -> &LabLanes {
        &self.lanes
    }

    fn entry(&self, id: SessionId) -> Option<Arc<Mutex<LabSession>>> {
        self.live.read().get(&id).cloned()
    }

    /// Live entry, or the reason there is none.
    fn live_entry(&self, id: SessionId) -> Result<Arc<Mutex<LabSession>>, LabError> {
        if let Some(entry) = self.entry(id) {
            return Ok(entry);
        }
        match self.store.get_session(id)? {
            Some(s) if s.status.is_terminal() => Err(LabError::SessionAlreadyTerminal(id)),
            _ => Err(LabError::SessionNotFound(id)),
        }
    }

    fn handle(session: &LabSession, hardware: HardwareConfig) -> SessionHandle {
        SessionHandle {
            session_id: session.id,
            lab_id: session.lab_id.clone(),
            user_id: session.user_id.clone(),
            status: session.status,
            access_token: session.access_token.clone(),
            channel: ChannelDescriptor::new(&session.lab_id, session.id),
            hardware,
            started_at_ms: session.started_at_ms,
            expires_at_ms: session.deadline_ms,
            confirm_by_ms: session.confirm_by_ms,
        }
    }

    /// Open a session for `user_id` on a free, online lab.
    ///
    /// Never queues: a busy lab fails with [`LabError::ResourceBusy`].
    ///
    /// # Errors
    /// [`LabError::ResourceBusy`], [`LabError::HardwareOffline`],
    /// [`LabError::LabNotFound`] or [`LabError::Storage`].
    pub fn start(&self, lab_id: &str, user_id: &str) -> Result<SessionHandle, LabError> {
        let lane = self.lanes.lane(lab_id);
        let _guard = lane.lock();
        self.open_locked(lab_id, user_id, false)
    }

    fn open_locked(&self, lab_id: &str, user_id: &str, promoted: bool) -> Result<SessionHandle, LabError> {
        let lab = self.registry.get(lab_id)?;
        let lease = self.registry.acquire(lab_id, user_id)?;
        let now = lease.acquired_at_ms;
        let grace = self.policy.confirm_grace.filter(|_| promoted);

        let session = LabSession {
            id: new_id(),
            lab_id: lab_id.to_string(),
            user_id: user_id.to_string(),
            status: if grace.is_some() {
                SessionStatus::Requested
            } else {
                SessionStatus::Active
            },
            started_at_ms: now,
            activated_at_ms: if grace.is_some() { None } else { Some(now) },
            deadline_ms: now + duration_ms(lab.max_session()),
            confirm_by_ms: grace.map(|g| now + duration_ms(g)),
            ended_at_ms: None,
            duration_seconds: 0,
            end_reason: None,
            compilation_status: None,
            xp_earned: 0,
            rating: None,
            feedback: None,
            access_token: new_id().simple().to_string(),
            warned_thresholds: Vec::new(),
        };
        if let Err(e) = self.store.save_session(&session) {
            if let Err(release_err) = self.registry.release(lab_id) {
                tracing::error!(lab_id, error = %release_err, "failed to roll back acquisition");
            }
            return Err(e);
        }

        self.live
            .write()
            .insert(session.id, Arc::new(Mutex::new(session.clone())));
        self.by_lab.write().insert(lab_id.to_string(), session.id);
        self.bridge.open_channel(lab_id, session.id);

        if !promoted {
            match self.queue.leave(lab_id, user_id) {
                Ok(()) | Err(LabError::NotQueued(_)) => {}
                Err(e) => tracing::warn!(lab_id, user_id, error = %e, "failed to drop queue entry"),
            }
        }
        if let Some(booking_id) = self.bookings.check_in_for(lab_id, user_id, session.id) {
            tracing::info!(lab_id, user_id, %booking_id, "booking checked in");
        }

        self.events.publish(LabEvent::SessionStarted {
            session_id: session.id,
            lab_id: lab_id.to_string(),
            user_id: user_id.to_string(),
            promoted,
        });
        if promoted {
            self.events.publish(LabEvent::Notification {
                user_id: user_id.to_string(),
                title: format!("{} is ready", lab.name),
                body: "You reached the front of the queue.".into(),
            });
        }
        tracing::info!(lab_id, user_id, session_id = %session.id, status = ?session.status, promoted, "session opened");
        Ok(Self::handle(&session, lab.hardware))
    }

    /// Confirm a promoted session, activating it with a full time budget.
    /// Confirming an active session is a no-op.
    ///
    /// # Errors
    /// [`LabError::SessionNotFound`], [`LabError::SessionAlreadyTerminal`]
    /// or [`LabError::Storage`].
    pub fn confirm(&self, session_id: SessionId) -> Result<SessionHandle, LabError> {
        let entry = self.live_entry(session_id)?;
        let lab_id = entry.lock().lab_id.clone();
        let lane = self.lanes.lane(&lab_id);
        let _guard = lane.lock();

        let mut session = entry.lock();
        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Requested => {
                let now = self.clock.now_ms();
                let budget = session.deadline_ms.saturating_sub(session.started_at_ms);
                let mut next = session.clone();
                next.status = SessionStatus::Active;
                next.activated_at_ms = Some(now);
                next.deadline_ms = now + budget;
                next.confirm_by_ms = None;
                self.store.save_session(&next)?;
                *session = next;
                tracing::info!(lab_id = %lab_id, %session_id, "session confirmed");
            }
            SessionStatus::Completed | SessionStatus::Expired | SessionStatus::Cancelled => {
                return Err(LabError::SessionAlreadyTerminal(session_id));
            }
        }
        let snapshot = session.clone();
        drop(session);
        let hardware = self.registry.get(&lab_id)?.hardware;
        Ok(Self::handle(&snapshot, hardware))
    }

    /// Seconds left before the session's hard deadline, floored at zero.
    ///
    /// # Errors
    /// [`LabError::SessionNotFound`] or [`LabError::Storage`].
    pub fn heartbeat_remaining(&self, session_id: SessionId) -> Result<u64, LabError> {
        Ok(self.get(session_id)?.remaining_secs(self.clock.now_ms()))
    }

    /// End a session, release its lab and promote the next waiter.
    ///
    /// # Errors
    /// [`LabError::InvalidFeedback`] for a rating outside 1..=5 (the session
    /// keeps running), [`LabError::SessionNotFound`],
    /// [`LabError::SessionAlreadyTerminal`] or [`LabError::Storage`].
    pub fn end(
        &self,
        session_id: SessionId,
        reason: EndReason,
        feedback: Option<SessionFeedback>,
    ) -> Result<SessionSummary, LabError> {
        if let Some(feedback) = &feedback {
            feedback.validate()?;
        }
        let entry = self.live_entry(session_id)?;
        let lab_id = entry.lock().lab_id.clone();
        let lane = self.lanes.lane(&lab_id);
        let _guard = lane.lock();
        self.end_locked(&entry, reason, feedback)
    }

    fn end_locked(
        &self,
        entry: &Arc<Mutex<LabSession>>,
        reason: EndReason,
        feedback: Option<SessionFeedback>,
    ) -> Result<SessionSummary, LabError> {
        let now = self.clock.now_ms();
        let mut session = entry.lock();
        if session.status.is_terminal() {
            return Err(LabError::SessionAlreadyTerminal(session.id));
        }

        let served_ms = session
            .activated_at_ms
            .map_or(0, |at| now.min(session.deadline_ms).saturating_sub(at));
        let duration_seconds = u64::try_from(served_ms / 1000).unwrap_or(u64::MAX);
        let xp_earned = self.policy.xp.award(duration_seconds, reason);

        let mut next = session.clone();
        next.status = reason.terminal_status();
        next.ended_at_ms = Some(now);
        next.duration_seconds = duration_seconds;
        next.end_reason = Some(reason);
        next.xp_earned = xp_earned;
        if let Some(feedback) = feedback {
            next.rating = feedback.rating;
            next.feedback = feedback.comment;
        }
        self.store.save_session(&next)?;
        *session = next;
        let ended = session.clone();
        drop(session);

        self.live.write().remove(&ended.id);
        {
            let mut by_lab = self.by_lab.write();
            if by_lab.get(&ended.lab_id) == Some(&ended.id) {
                by_lab.remove(&ended.lab_id);
            }
        }
        self.bridge.close_channel(&ended.lab_id, ended.id);
        if let Err(e) = self.registry.release(&ended.lab_id) {
            tracing::error!(lab_id = %ended.lab_id, error = %e, "failed to release lab");
        }
        if let Some(booking_id) = self.bookings.complete_for_session(ended.id) {
            tracing::debug!(%booking_id, "booking completed");
        }

        self.events.publish(LabEvent::SessionEnded {
            session_id: ended.id,
            lab_id: ended.lab_id.clone(),
            user_id: ended.user_id.clone(),
            reason,
            duration_seconds,
            xp_earned,
        });
        if xp_earned > 0 {
            self.events.publish(LabEvent::RewardEarned(RewardEvent {
                user_id: ended.user_id.clone(),
                lab_id: ended.lab_id.clone(),
                session_id: ended.id,
                xp: xp_earned,
                duration_seconds,
                reason,
            }));
        }
        self.events.publish(LabEvent::Notification {
            user_id: ended.user_id.clone(),
            title: "Lab session ended".into(),
            body: format!("Session ended ({reason:?}) after {duration_seconds}s, {xp_earned} XP earned."),
        });
        tracing::info!(
            lab_id = %ended.lab_id,
            session_id = %ended.id,
            ?reason,
            duration_seconds,
            xp_earned,
            "session ended"
        );

        if let Err(e) = self.promote_locked(&ended.lab_id) {
            tracing::error!(lab_id = %ended.lab_id, error = %e, "promotion after release failed");
        }

        Ok(SessionSummary {
            session_id: ended.id,
            lab_id: ended.lab_id,
            status: ended.status,
            reason,
            duration_seconds,
            xp_earned,
        })
    }

    /// Promote the next waiter if the lab is free and online.
    ///
    /// # Errors
    /// [`LabError::LabNotFound`] or [`LabError::Storage`].
    pub fn promote_next(&self, lab_id: &str) -> Result<Option<SessionHandle>, LabError> {
        let lane = self.lanes.lane(lab_id);
        let _guard = lane.lock();
        self.promote_locked(lab_id)
    }

    /// [`promote_next`](Self::promote_next) for callers already on the lane.
    pub(crate) fn promote_locked(&self, lab_id: &str) -> Result<Option<SessionHandle>, LabError> {
        let lab = self.registry.get(lab_id)?;
        if !lab.is_startable() || self.by_lab.read().contains_key(lab_id) {
            return Ok(None);
        }
        let Some(entry) = self.queue.promote_next(lab_id)? else {
            return Ok(None);
        };
        match self.open_locked(lab_id, &entry.user_id, true) {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => {
                self.queue.reinstate(entry);
                Err(e)
            }
        }
    }

    /// Emit due warnings, expire overdue sessions, and cancel promotions
    /// that were never confirmed.
    pub fn check_deadlines(&self) -> DeadlineReport {
        let mut report = DeadlineReport::default();
        let live: Vec<(LabId, SessionId)> = self
            .by_lab
            .read()
            .iter()
            .map(|(lab, id)| (lab.clone(), *id))
            .collect();

        for (lab_id, session_id) in live {
            let lane = self.lanes.lane(&lab_id);
            let _guard = lane.lock();
            let Some(entry) = self.entry(session_id) else {
                continue;
            };
            let now = self.clock.now_ms();
            let (status, confirm_by, deadline) = {
                let s = entry.lock();
                (s.status, s.confirm_by_ms, s.deadline_ms)
            };

            let outcome = match status {
                SessionStatus::Requested if confirm_by.is_some_and(|c| now >= c) => {
                    tracing::warn!(lab_id = %lab_id, %session_id, "promotion not confirmed in time");
                    Some((EndReason::Cancelled, &mut report.unconfirmed))
                }
                SessionStatus::Active if now >= deadline => {
                    Some((EndReason::Expired, &mut report.expired))
                }
                SessionStatus::Active => {
                    if self.warn_locked(&entry, now) {
                        report.warnings += 1;
                    }
                    None
                }
                _ => None,
            };
            if let Some((reason, counter)) = outcome {
                match self.end_locked(&entry, reason, None) {
                    Ok(_) => *counter += 1,
                    Err(e) => tracing::debug!(%session_id, error = %e, "deadline end skipped"),
                }
            }
        }
        report
    }

    /// Announce newly crossed warning thresholds. Each threshold fires once;
    /// when several are crossed together only the tightest is announced.
    fn warn_locked(&self, entry: &Arc<Mutex<LabSession>>, now: u128) -> bool {
        let mut session = entry.lock();
        let remaining = session.remaining_secs(now);
        let crossed: Vec<u64> = self
            .policy
            .warning_thresholds_secs
            .iter()
            .copied()
            .filter(|t| remaining <= *t && !session.warned_thresholds.contains(t))
            .collect();
        let Some(&tightest) = crossed.first() else {
            return false;
        };

        let mut next = session.clone();
        next.warned_thresholds.extend(crossed);
        if let Err(e) = self.store.save_session(&next) {
            tracing::error!(session_id = %next.id, error = %e, "failed to persist warning state");
            return false;
        }
        *session = next;
        self.events.publish(LabEvent::SessionWarning {
            session_id: session.id,
            lab_id: session.lab_id.clone(),
            user_id: session.user_id.clone(),
            remaining_secs: remaining,
            threshold_secs: tightest,
        });
        tracing::debug!(session_id = %session.id, remaining, tightest, "session warning");
        true
    }

    /// Check every lab's heartbeat and force-end sessions on silent labs.
    ///
    /// Served time up to the sweep is kept and rewarded.
    pub fn sweep_offline(&self) -> OfflineSweep {
        let mut sweep = OfflineSweep::default();
        for lab_id in self.registry.ids() {
            let lane = self.lanes.lane(&lab_id);
            let _guard = lane.lock();
            let check = match self.registry.check_offline(&lab_id) {
                Ok(Some(check)) => check,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(lab_id = %lab_id, error = %e, "offline check failed");
                    continue;
                }
            };
            if check.went_offline {
                sweep.went_offline += 1;
                self.bridge
                    .note(&lab_id, None, HardwareEventKind::Connection, "agent heartbeat lost");
            }
            if check.marked_offline {
                sweep.marked_offline += 1;
            }

            let live = self.by_lab.read().get(&lab_id).copied();
            let Some(entry) = live.and_then(|id| self.entry(id)) else {
                continue;
            };
            match self.end_locked(&entry, EndReason::HardwareOffline, None) {
                Ok(summary) => {
                    tracing::warn!(lab_id = %lab_id, session_id = %summary.session_id, "session force-ended, hardware offline");
                    sweep.force_ended.push(summary);
                }
                Err(e) => tracing::debug!(lab_id = %lab_id, error = %e, "offline end skipped"),
            }
        }
        sweep
    }

    /// Snapshot the latest compilation status onto a live session.
    ///
    /// # Errors
    /// [`LabError::Storage`].
    pub fn record_compilation(&self, session_id: SessionId, status: CompilationStatus) -> Result<(), LabError> {
        let Some(entry) = self.entry(session_id) else {
            return Ok(());
        };
        let mut session = entry.lock();
        if session.status.is_terminal() || session.compilation_status == Some(status) {
            return Ok(());
        }
        let mut next = session.clone();
        next.compilation_status = Some(status);
        self.store.save_session(&next)?;
        *session = next;
        Ok(())
    }

    /// Fetch a session, live or finished.
    ///
    /// # Errors
    /// [`LabError::SessionNotFound`] or [`LabError::Storage`].
    pub fn get(&self, session_id: SessionId) -> Result<LabSession, LabError> {
        if let Some(entry) = self.entry(session_id) {
            return Ok(entry.lock().clone());
        }
        self.store
            .get_session(session_id)?
            .ok_or(LabError::SessionNotFound(session_id))
    }

    /// Session that must be `active` for the caller to proceed.
    ///
    /// # Errors
    /// [`LabError::SessionNotActive`] while `requested`,
    /// [`LabError::SessionAlreadyTerminal`] once ended, or
    /// [`LabError::SessionNotFound`].
    pub fn require_active(&self, session_id: SessionId) -> Result<LabSession, LabError> {
        let session = self.get(session_id)?;
        match session.status {
            SessionStatus::Active => Ok(session),
            SessionStatus::Requested => Err(LabError::SessionNotActive(session_id)),
            SessionStatus::Completed | SessionStatus::Expired | SessionStatus::Cancelled => {
                Err(LabError::SessionAlreadyTerminal(session_id))
            }
        }
    }

    /// Live session on a lab.
    #[must_use]
    pub fn active_for_lab(&self, lab_id: &str) -> Option<LabSession> {
        let id = self.by_lab.read().get(lab_id).copied()?;
        self.entry(id).map(|e| e.lock().clone())
    }

    /// Number of live sessions across all labs.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }
}
