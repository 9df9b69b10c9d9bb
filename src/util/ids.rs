//! Identifier aliases shared across the broker.

use uuid::Uuid;

/// Lab identifier. Doubles as the logical topic root on the message bus.
pub type LabId = String;

/// Identifier of a remote user, owned by the external account system.
pub type UserId = String;

/// Session identifier.
pub type SessionId = Uuid;

/// Compilation job identifier.
pub type CompilationId = Uuid;

/// Future-booking identifier.
pub type BookingId = Uuid;

/// Hardware log entry identifier.
pub type LogId = Uuid;

/// Generate a fresh random identifier.
#[must_use]
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}
