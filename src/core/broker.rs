//! Broker facade tying the components together.
//!
//! [`LabBroker`] is what request handlers, agent pumps and the sweeper talk
//! to. It checks ownership, routes inbound agent traffic, and runs the
//! scheduler step ([`LabBroker::tick`]) against the injected clock.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::booking::BookingLedger;
use crate::core::bridge::{HardwareBridge, InboundDispatch};
use crate::core::compilation::{CompilationPipeline, CompilationView, ResultOutcome};
use crate::core::events::{EventBus, LabEvent};
use crate::core::model::{
    CodeLanguage, EndReason, Lab, LabBooking, LabSession, LabStatus, SessionFeedback,
};
use crate::core::protocol::ActuatorCommand;
use crate::core::registry::LabRegistry;
use crate::core::reservation::{QueueTicket, ReservationQueue};
use crate::core::session::{SessionHandle, SessionManager, SessionSummary};
use crate::core::{LabError, LabStore};
use crate::util::{BookingId, CompilationId, SessionId, SharedClock};

/// Result of asking for a place in a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JoinOutcome {
    /// The user waits at the given position.
    Queued(QueueTicket),
    /// The lab was idle and the user was promoted straight away.
    Started(SessionHandle),
}

/// Counts from one scheduler step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Queue entries evicted after their TTL.
    pub queue_expired: usize,
    /// Labs whose agent fell silent.
    pub labs_went_offline: usize,
    /// Labs moved to `offline` status.
    pub labs_marked_offline: usize,
    /// Sessions force-ended because their lab went offline.
    pub sessions_force_ended: usize,
    /// Time warnings emitted.
    pub warnings: usize,
    /// Sessions that ran into their deadline.
    pub sessions_expired: usize,
    /// Promotions cancelled for lack of confirmation.
    pub promotions_cancelled: usize,
    /// Users promoted from a queue during the sweep.
    pub promoted: usize,
    /// Compilation jobs failed after stalling.
    pub compilations_failed: usize,
    /// Bookings marked as no-show.
    pub bookings_no_show: usize,
}

impl SweepReport {
    /// Whether the step changed anything.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.queue_expired == 0
            && self.labs_went_offline == 0
            && self.labs_marked_offline == 0
            && self.sessions_force_ended == 0
            && self.warnings == 0
            && self.sessions_expired == 0
            && self.promotions_cancelled == 0
            && self.promoted == 0
            && self.compilations_failed == 0
            && self.bookings_no_show == 0
    }
}

/// Lab reservation and session broker.
pub struct LabBroker {
    pub(crate) registry: Arc<LabRegistry>,
    pub(crate) queue: Arc<ReservationQueue>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) bridge: Arc<HardwareBridge>,
    pub(crate) pipeline: Arc<CompilationPipeline>,
    pub(crate) bookings: Arc<BookingLedger>,
    pub(crate) store: Arc<dyn LabStore>,
    pub(crate) clock: SharedClock,
    pub(crate) events: EventBus,
}

impl LabBroker {
    /// Lab registry.
    #[must_use]
    pub fn registry(&self) -> &LabRegistry {
        &self.registry
    }

    /// Reservation queues.
    #[must_use]
    pub fn queue(&self) -> &ReservationQueue {
        &self.queue
    }

    /// Session manager.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Hardware bridge.
    #[must_use]
    pub fn bridge(&self) -> &HardwareBridge {
        &self.bridge
    }

    /// Compilation pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &CompilationPipeline {
        &self.pipeline
    }

    /// Booking ledger.
    #[must_use]
    pub fn bookings(&self) -> &BookingLedger {
        &self.bookings
    }

    /// Event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Clock every timeout is measured against.
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Subscribe to broker events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LabEvent> {
        self.events.subscribe()
    }

    /// Register a lab and reload its persisted queue.
    ///
    /// # Errors
    /// [`LabError::Storage`].
    pub fn register_lab(&self, lab: Lab) -> Result<(), LabError> {
        let lab_id = lab.id.clone();
        self.registry.register(lab)?;
        let restored = self.queue.restore(&lab_id)?;
        if restored > 0 {
            tracing::info!(lab_id = %lab_id, restored, "queue restored from store");
        }
        Ok(())
    }

    /// All labs.
    #[must_use]
    pub fn list_labs(&self) -> Vec<Lab> {
        self.registry.list()
    }

    fn owned_session(&self, session_id: SessionId, user_id: &str) -> Result<LabSession, LabError> {
        let session = self.sessions.get(session_id)?;
        if session.user_id != user_id {
            return Err(LabError::SessionNotFound(session_id));
        }
        Ok(session)
    }

    /// Join a lab's queue. An idle lab with nobody waiting is handed over
    /// immediately; if that hand-over fails the user simply stays queued.
    ///
    /// # Errors
    /// [`LabError::InvalidBid`], [`LabError::AlreadyQueued`],
    /// [`LabError::QueueFull`], [`LabError::LabNotFound`] or
    /// [`LabError::Storage`].
    pub fn join_queue(&self, lab_id: &str, user_id: &str, bid_amount: i64) -> Result<JoinOutcome, LabError> {
        let lane = self.sessions.lanes().lane(lab_id);
        let _guard = lane.lock();

        let lab = self.registry.get(lab_id)?;
        if lab.current_user_id.as_deref() == Some(user_id) {
            return Err(LabError::ResourceBusy(lab_id.to_string()));
        }
        let ticket = self.queue.join(lab_id, user_id, bid_amount)?;
        match self.sessions.promote_locked(lab_id) {
            Ok(Some(handle)) if handle.user_id == user_id => return Ok(JoinOutcome::Started(handle)),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(lab_id, user_id, error = %e, "immediate hand-over failed, entry stays queued");
            }
        }
        Ok(JoinOutcome::Queued(
            self.queue.position_of(lab_id, user_id).unwrap_or(ticket),
        ))
    }

    /// Leave a lab's queue.
    ///
    /// # Errors
    /// [`LabError::NotQueued`] or [`LabError::Storage`].
    pub fn leave_queue(&self, lab_id: &str, user_id: &str) -> Result<(), LabError> {
        let lane = self.sessions.lanes().lane(lab_id);
        let _guard = lane.lock();
        self.queue.leave(lab_id, user_id)
    }

    /// Current queue standing.
    ///
    /// # Errors
    /// [`LabError::NotQueued`] or [`LabError::QueueEntryExpired`].
    pub fn queue_position(&self, lab_id: &str, user_id: &str) -> Result<QueueTicket, LabError> {
        self.queue.position_of(lab_id, user_id)
    }

    /// Start a session on an idle lab.
    ///
    /// # Errors
    /// [`LabError::ResourceBusy`] or [`LabError::HardwareOffline`]; the
    /// caller decides whether to queue instead.
    pub fn start_session(&self, lab_id: &str, user_id: &str) -> Result<SessionHandle, LabError> {
        self.sessions.start(lab_id, user_id)
    }

    /// Confirm a promoted session.
    ///
    /// # Errors
    /// [`LabError::SessionNotFound`] (also for other users' sessions) or
    /// [`LabError::SessionAlreadyTerminal`].
    pub fn confirm_session(&self, session_id: SessionId, user_id: &str) -> Result<SessionHandle, LabError> {
        self.owned_session(session_id, user_id)?;
        self.sessions.confirm(session_id)
    }

    /// End a session at the user's request.
    ///
    /// # Errors
    /// [`LabError::InvalidFeedback`] for a rating outside 1..=5,
    /// [`LabError::SessionNotFound`] or [`LabError::SessionAlreadyTerminal`].
    pub fn end_session(
        &self,
        session_id: SessionId,
        user_id: &str,
        feedback: Option<SessionFeedback>,
    ) -> Result<SessionSummary, LabError> {
        self.owned_session(session_id, user_id)?;
        self.sessions.end(session_id, EndReason::UserRequested, feedback)
    }

    /// Withdraw a session, typically a promotion the user does not want.
    ///
    /// # Errors
    /// [`LabError::SessionNotFound`] or [`LabError::SessionAlreadyTerminal`].
    pub fn cancel_session(&self, session_id: SessionId, user_id: &str) -> Result<SessionSummary, LabError> {
        self.owned_session(session_id, user_id)?;
        self.sessions.end(session_id, EndReason::Cancelled, None)
    }

    /// Seconds left in a session.
    ///
    /// # Errors
    /// [`LabError::SessionNotFound`].
    pub fn remaining(&self, session_id: SessionId) -> Result<u64, LabError> {
        self.sessions.heartbeat_remaining(session_id)
    }

    /// Submit code for build and flash.
    ///
    /// # Errors
    /// See [`CompilationPipeline::submit`].
    pub fn submit_code(
        &self,
        session_id: SessionId,
        user_id: &str,
        code: String,
        language: CodeLanguage,
        filename: Option<String>,
    ) -> Result<CompilationView, LabError> {
        self.owned_session(session_id, user_id)?;
        self.pipeline.submit(session_id, code, language, filename)
    }

    /// Poll a compilation job.
    ///
    /// # Errors
    /// [`LabError::CompilationNotFound`] (also for other users' jobs).
    pub fn poll_compilation(&self, compilation_id: CompilationId, user_id: &str) -> Result<CompilationView, LabError> {
        let job = self.pipeline.job(compilation_id)?;
        if job.user_id != user_id {
            return Err(LabError::CompilationNotFound(compilation_id));
        }
        Ok(CompilationView::from(&job))
    }

    /// Drive an actuator during an active session.
    ///
    /// # Errors
    /// [`LabError::SessionNotActive`], [`LabError::SessionNotFound`] or
    /// [`LabError::Bridge`].
    pub fn send_actuator(
        &self,
        session_id: SessionId,
        user_id: &str,
        command: ActuatorCommand,
    ) -> Result<(), LabError> {
        let session = self.owned_session(session_id, user_id)?;
        self.sessions.require_active(session_id)?;
        self.bridge.send_actuator(&session.lab_id, session_id, command)
    }

    /// Route one payload received from an agent on `topic`.
    ///
    /// # Errors
    /// [`LabError::Bridge`] for malformed payloads,
    /// [`LabError::LabNotFound`] for heartbeats from unknown labs,
    /// [`LabError::CompilationNotFound`] for results nobody submitted.
    pub fn handle_inbound(&self, topic: &str, payload: &[u8]) -> Result<InboundDispatch, LabError> {
        let dispatch = self.bridge.receive(topic, payload)?;
        match &dispatch {
            InboundDispatch::Sensor { .. } => {}
            InboundDispatch::CompilationResult { lab_id, result } => {
                if let ResultOutcome::Applied(status) = self.pipeline.on_result(lab_id, result)? {
                    tracing::debug!(lab_id = %lab_id, compilation_id = %result.compilation_id, ?status, "compilation result applied");
                }
            }
            InboundDispatch::Heartbeat { lab_id, heartbeat } => {
                let came_online = {
                    let lane = self.sessions.lanes().lane(lab_id);
                    let _guard = lane.lock();
                    self.registry
                        .record_heartbeat(lab_id, &heartbeat.agent_id, heartbeat.metrics.clone())?
                };
                if came_online {
                    self.sessions.promote_next(lab_id)?;
                }
            }
        }
        Ok(dispatch)
    }

    /// Operator status override. Clearing a lab to `available` promotes the
    /// next waiter.
    ///
    /// # Errors
    /// [`LabError::ResourceBusy`] while occupied, [`LabError::InvalidTransition`]
    /// for `busy`.
    pub fn set_lab_status(&self, lab_id: &str, status: LabStatus) -> Result<Lab, LabError> {
        let lane = self.sessions.lanes().lane(lab_id);
        let _guard = lane.lock();
        let lab = self.registry.set_status(lab_id, status)?;
        if status == LabStatus::Available {
            self.sessions.promote_locked(lab_id)?;
        }
        self.registry.get(&lab.id)
    }

    /// Book a future window on a lab.
    ///
    /// # Errors
    /// [`LabError::LabNotFound`] or [`LabError::BookingConflict`].
    pub fn book_lab(
        &self,
        lab_id: &str,
        user_id: &str,
        starts_at_ms: u128,
        length: Duration,
    ) -> Result<LabBooking, LabError> {
        self.registry.get(lab_id)?;
        self.bookings.book(lab_id, user_id, starts_at_ms, length)
    }

    fn owned_booking(&self, booking_id: BookingId, user_id: &str) -> Result<(), LabError> {
        if self.bookings.get(booking_id)?.user_id == user_id {
            Ok(())
        } else {
            Err(LabError::BookingNotFound(booking_id))
        }
    }

    /// Confirm the user's pending booking.
    ///
    /// # Errors
    /// [`LabError::BookingNotFound`] or [`LabError::InvalidTransition`].
    pub fn confirm_booking(&self, booking_id: BookingId, user_id: &str) -> Result<LabBooking, LabError> {
        self.owned_booking(booking_id, user_id)?;
        self.bookings.confirm(booking_id)
    }

    /// Cancel the user's booking.
    ///
    /// # Errors
    /// [`LabError::BookingNotFound`] or [`LabError::InvalidTransition`].
    pub fn cancel_booking(&self, booking_id: BookingId, user_id: &str) -> Result<LabBooking, LabError> {
        self.owned_booking(booking_id, user_id)?;
        self.bookings.cancel(booking_id)
    }

    /// One scheduler step: queue TTLs, offline labs, session deadlines,
    /// stalled compilations and no-show bookings, then promotion of any
    /// idle lab with waiters.
    pub fn tick(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for lab_id in self.registry.ids() {
            let lane = self.sessions.lanes().lane(&lab_id);
            let _guard = lane.lock();
            match self.queue.expire_stale(&lab_id) {
                Ok(expired) => report.queue_expired += expired.len(),
                Err(e) => tracing::error!(lab_id = %lab_id, error = %e, "queue sweep failed"),
            }
        }

        let offline = self.sessions.sweep_offline();
        report.labs_went_offline = offline.went_offline;
        report.labs_marked_offline = offline.marked_offline;
        report.sessions_force_ended = offline.force_ended.len();

        let deadlines = self.sessions.check_deadlines();
        report.warnings = deadlines.warnings;
        report.sessions_expired = deadlines.expired;
        report.promotions_cancelled = deadlines.unconfirmed;

        report.compilations_failed = self.pipeline.sweep_stalled().len();
        report.bookings_no_show = self.bookings.sweep_no_shows().len();

        for lab_id in self.registry.ids() {
            if self.queue.is_empty(&lab_id) {
                continue;
            }
            match self.sessions.promote_next(&lab_id) {
                Ok(Some(_)) => report.promoted += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(lab_id = %lab_id, error = %e, "sweep promotion failed"),
            }
        }

        if !report.is_idle() {
            tracing::debug!(?report, "sweep completed");
        }
        report
    }

    /// Close the store. Later writes fail.
    pub fn shutdown(&self) {
        self.store.close();
        tracing::info!("lab broker shut down");
    }
}
