//! Error types for broker operations.

use thiserror::Error;

use crate::util::{BookingId, CompilationId, LabId, SessionId};

/// Errors produced by broker components.
///
/// Variants carry enough context for the caller to decide whether to queue,
/// retry, or inform the user; [`LabError::kind`] gives a stable tag for
/// request-facing responses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabError {
    /// The lab identifier is unknown to the registry.
    #[error("lab not found: {0}")]
    LabNotFound(LabId),
    /// The lab is occupied or otherwise not available for a new session.
    #[error("lab busy: {0}")]
    ResourceBusy(LabId),
    /// The user already holds a queue entry for this lab.
    #[error("already queued for lab {0}")]
    AlreadyQueued(LabId),
    /// The user holds no queue entry for this lab.
    #[error("not queued for lab {0}")]
    NotQueued(LabId),
    /// The user's queue entry lapsed before it could be used.
    #[error("queue entry expired for lab {0}")]
    QueueEntryExpired(LabId),
    /// The lab's queue is at its configured depth.
    #[error("queue full for lab {0}")]
    QueueFull(LabId),
    /// The lab agent has not sent a recent heartbeat.
    #[error("hardware offline: {0}")]
    HardwareOffline(LabId),
    /// No session with this identifier exists.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    /// The session already reached a terminal state.
    #[error("session already ended: {0}")]
    SessionAlreadyTerminal(SessionId),
    /// The session exists but is not active.
    #[error("session not active: {0}")]
    SessionNotActive(SessionId),
    /// No compilation job with this identifier exists.
    #[error("compilation not found: {0}")]
    CompilationNotFound(CompilationId),
    /// The agent never reported a result for the job.
    #[error("compilation timed out: {0}")]
    CompilationTimeout(CompilationId),
    /// Bid amount is negative or above the configured ceiling.
    #[error("invalid bid: {0}")]
    InvalidBid(i64),
    /// Session feedback outside the accepted range.
    #[error("invalid feedback: {0}")]
    InvalidFeedback(String),
    /// No booking with this identifier exists.
    #[error("booking not found: {0}")]
    BookingNotFound(BookingId),
    /// Requested booking window overlaps another live booking.
    #[error("booking window conflicts with an existing booking on lab {0}")]
    BookingConflict(LabId),
    /// A state machine was asked to make a move it does not allow.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// State the record was in.
        from: String,
        /// State that was requested.
        to: String,
    },
    /// Message bus failure or malformed agent payload.
    #[error("bridge error: {0}")]
    Bridge(String),
    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl LabError {
    /// Stable snake_case tag identifying the failure kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::LabNotFound(_) => "lab_not_found",
            Self::ResourceBusy(_) => "resource_busy",
            Self::AlreadyQueued(_) => "already_queued",
            Self::NotQueued(_) => "not_queued",
            Self::QueueEntryExpired(_) => "queue_entry_expired",
            Self::QueueFull(_) => "queue_full",
            Self::HardwareOffline(_) => "hardware_offline",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionAlreadyTerminal(_) => "session_already_terminal",
            Self::SessionNotActive(_) => "session_not_active",
            Self::CompilationNotFound(_) => "compilation_not_found",
            Self::CompilationTimeout(_) => "compilation_timeout",
            Self::InvalidBid(_) => "invalid_bid",
            Self::InvalidFeedback(_) => "invalid_feedback",
            Self::BookingNotFound(_) => "booking_not_found",
            Self::BookingConflict(_) => "booking_conflict",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Bridge(_) => "bridge",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
        }
    }

    pub(crate) fn transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }
}

/// Application-facing result using anyhow for wiring and bootstrap code.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_busy_display() {
        let err = LabError::ResourceBusy("lab-1".into());
        assert_eq!(err.to_string(), "lab busy: lab-1");
        assert_eq!(err.kind(), "resource_busy");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = LabError::InvalidTransition {
            from: "Completed".into(),
            to: "Active".into(),
        };
        assert_eq!(err.to_string(), "invalid transition from Completed to Active");
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[test]
    fn test_invalid_bid_kind() {
        assert_eq!(LabError::InvalidBid(-5).kind(), "invalid_bid");
        assert_eq!(LabError::InvalidBid(-5).to_string(), "invalid bid: -5");
    }
}
