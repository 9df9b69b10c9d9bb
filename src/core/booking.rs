//! Future bookings, separate from the live queue.
//!
//! `pending → confirmed → active → completed`, with `cancelled` and
//! `no_show` as the other exits. Live bookings on one lab never overlap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::core::model::{BookingStatus, LabBooking};
use crate::core::{LabError, LabStore};
use crate::util::{duration_ms, new_id, BookingId, SessionId, SharedClock};

/// Ledger of future reservations.
pub struct BookingLedger {
    bookings: RwLock<HashMap<BookingId, LabBooking>>,
    store: Arc<dyn LabStore>,
    clock: SharedClock,
    no_show_grace: Duration,
}

impl BookingLedger {
    /// Create an empty ledger. Bookings not checked into within
    /// `no_show_grace` of their start become `no_show`.
    pub fn new(store: Arc<dyn LabStore>, clock: SharedClock, no_show_grace: Duration) -> Self {
        Self {
            bookings: RwLock::new(HashMap::new()),
            store,
            clock,
            no_show_grace,
        }
    }

    /// Book `[starts_at_ms, starts_at_ms + length)` on a lab.
    ///
    /// # Errors
    /// [`LabError::BookingConflict`] if the window overlaps another live
    /// booking on the lab, [`LabError::Storage`] on write failure.
    pub fn book(
        &self,
        lab_id: &str,
        user_id: &str,
        starts_at_ms: u128,
        length: Duration,
    ) -> Result<LabBooking, LabError> {
        let ends_at_ms = starts_at_ms + duration_ms(length).max(1);
        let mut bookings = self.bookings.write();
        let clash = bookings
            .values()
            .any(|b| b.lab_id == lab_id && b.status.is_live() && b.overlaps(starts_at_ms, ends_at_ms));
        if clash {
            return Err(LabError::BookingConflict(lab_id.to_string()));
        }
        let booking = LabBooking {
            id: new_id(),
            lab_id: lab_id.to_string(),
            user_id: user_id.to_string(),
            starts_at_ms,
            ends_at_ms,
            status: BookingStatus::Pending,
            session_id: None,
            created_at_ms: self.clock.now_ms(),
        };
        self.store.save_booking(&booking)?;
        tracing::info!(lab_id, user_id, booking_id = %booking.id, "booking created");
        bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    fn transition(
        &self,
        id: BookingId,
        allowed: &[BookingStatus],
        to: BookingStatus,
        session_id: Option<SessionId>,
    ) -> Result<LabBooking, LabError> {
        let mut bookings = self.bookings.write();
        let slot = bookings.get_mut(&id).ok_or(LabError::BookingNotFound(id))?;
        if !allowed.contains(&slot.status) {
            return Err(LabError::transition(slot.status, to));
        }
        let mut next = slot.clone();
        next.status = to;
        if session_id.is_some() {
            next.session_id = session_id;
        }
        self.store.save_booking(&next)?;
        tracing::info!(booking_id = %id, from = ?slot.status, to = ?to, "booking transition");
        *slot = next;
        Ok(slot.clone())
    }

    /// `pending → confirmed`.
    ///
    /// # Errors
    /// [`LabError::BookingNotFound`] or [`LabError::InvalidTransition`].
    pub fn confirm(&self, id: BookingId) -> Result<LabBooking, LabError> {
        self.transition(id, &[BookingStatus::Pending], BookingStatus::Confirmed, None)
    }

    /// Withdraw a booking that has not started.
    ///
    /// # Errors
    /// [`LabError::BookingNotFound`] or [`LabError::InvalidTransition`].
    pub fn cancel(&self, id: BookingId) -> Result<LabBooking, LabError> {
        self.transition(
            id,
            &[BookingStatus::Pending, BookingStatus::Confirmed],
            BookingStatus::Cancelled,
            None,
        )
    }

    /// Mark the booking used by `session_id`. Only valid inside the window.
    ///
    /// # Errors
    /// [`LabError::BookingNotFound`] or [`LabError::InvalidTransition`].
    pub fn check_in(&self, id: BookingId, session_id: SessionId) -> Result<LabBooking, LabError> {
        let now = self.clock.now_ms();
        {
            let bookings = self.bookings.read();
            let booking = bookings.get(&id).ok_or(LabError::BookingNotFound(id))?;
            if now < booking.starts_at_ms || now >= booking.ends_at_ms {
                return Err(LabError::transition(booking.status, BookingStatus::Active));
            }
        }
        self.transition(
            id,
            &[BookingStatus::Pending, BookingStatus::Confirmed],
            BookingStatus::Active,
            Some(session_id),
        )
    }

    /// Check in the user's booking on `lab_id` whose window contains now.
    pub fn check_in_for(&self, lab_id: &str, user_id: &str, session_id: SessionId) -> Option<BookingId> {
        let now = self.clock.now_ms();
        let id = self
            .bookings
            .read()
            .values()
            .find(|b| {
                b.lab_id == lab_id
                    && b.user_id == user_id
                    && matches!(b.status, BookingStatus::Pending | BookingStatus::Confirmed)
                    && b.starts_at_ms <= now
                    && now < b.ends_at_ms
            })
            .map(|b| b.id)?;
        match self.check_in(id, session_id) {
            Ok(_) => Some(id),
            Err(e) => {
                tracing::warn!(booking_id = %id, error = %e, "automatic check-in failed");
                None
            }
        }
    }

    /// `active → completed`.
    ///
    /// # Errors
    /// [`LabError::BookingNotFound`] or [`LabError::InvalidTransition`].
    pub fn complete(&self, id: BookingId) -> Result<LabBooking, LabError> {
        self.transition(id, &[BookingStatus::Active], BookingStatus::Completed, None)
    }

    /// Complete the active booking used by `session_id`, if any.
    pub fn complete_for_session(&self, session_id: SessionId) -> Option<BookingId> {
        let id = self
            .bookings
            .read()
            .values()
            .find(|b| b.session_id == Some(session_id) && b.status == BookingStatus::Active)
            .map(|b| b.id)?;
        match self.complete(id) {
            Ok(_) => Some(id),
            Err(e) => {
                tracing::warn!(booking_id = %id, error = %e, "automatic completion failed");
                None
            }
        }
    }

    /// Move unclaimed bookings past their grace period to `no_show`.
    pub fn sweep_no_shows(&self) -> Vec<LabBooking> {
        let cutoff = self.clock.now_ms().saturating_sub(duration_ms(self.no_show_grace));
        let stale: Vec<BookingId> = self
            .bookings
            .read()
            .values()
            .filter(|b| {
                matches!(b.status, BookingStatus::Pending | BookingStatus::Confirmed)
                    && b.starts_at_ms < cutoff
            })
            .map(|b| b.id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                self.transition(
                    id,
                    &[BookingStatus::Pending, BookingStatus::Confirmed],
                    BookingStatus::NoShow,
                    None,
                )
                .map_err(|e| tracing::error!(booking_id = %id, error = %e, "no-show sweep failed"))
                .ok()
            })
            .collect()
    }

    /// Fetch a booking.
    ///
    /// # Errors
    /// [`LabError::BookingNotFound`].
    pub fn get(&self, id: BookingId) -> Result<LabBooking, LabError> {
        self.bookings
            .read()
            .get(&id)
            .cloned()
            .ok_or(LabError::BookingNotFound(id))
    }

    /// Bookings on a lab ordered by start time.
    #[must_use]
    pub fn for_lab(&self, lab_id: &str) -> Vec<LabBooking> {
        let mut list: Vec<_> = self
            .bookings
            .read()
            .values()
            .filter(|b| b.lab_id == lab_id)
            .cloned()
            .collect();
        list.sort_by_key(|b| b.starts_at_ms);
        list
    }
}
