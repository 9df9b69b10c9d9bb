//! Storage interface for broker records.
//!
//! Components keep their live state in memory and write through to a
//! [`LabStore`]. Backends are injected at construction and have an explicit
//! `open`/`close` lifecycle; writes against a closed store fail.

use crate::core::model::{CodeCompilation, Lab, LabBooking, LabQueueEntry, LabSession};
use crate::core::LabError;
use crate::util::{CompilationId, SessionId};

/// Abstraction for storage backends.
pub trait LabStore: Send + Sync {
    /// Open the backend. Opening an open store is a no-op.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] if the backend cannot be reached.
    fn open(&self) -> Result<(), LabError>;
    /// Close the backend; later writes fail.
    fn close(&self);
    /// Whether the store accepts writes.
    fn is_open(&self) -> bool;

    /// Upsert a lab.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] on backend failure.
    fn save_lab(&self, lab: &Lab) -> Result<(), LabError>;
    /// All stored labs.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] on backend failure.
    fn load_labs(&self) -> Result<Vec<Lab>, LabError>;

    /// Upsert a session.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] on backend failure.
    fn save_session(&self, session: &LabSession) -> Result<(), LabError>;
    /// Fetch a session.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] on backend failure.
    fn get_session(&self, id: SessionId) -> Result<Option<LabSession>, LabError>;
    /// Served durations (seconds) of the lab's most recent finished sessions,
    /// newest first.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] on backend failure.
    fn recent_session_durations(&self, lab_id: &str, limit: usize) -> Result<Vec<u64>, LabError>;

    /// Replace the stored queue snapshot for a lab.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] on backend failure.
    fn save_queue(&self, lab_id: &str, entries: &[LabQueueEntry]) -> Result<(), LabError>;
    /// Stored queue snapshot for a lab.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] on backend failure.
    fn load_queue(&self, lab_id: &str) -> Result<Vec<LabQueueEntry>, LabError>;

    /// Upsert a booking.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] on backend failure.
    fn save_booking(&self, booking: &LabBooking) -> Result<(), LabError>;

    /// Upsert a compilation job.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] on backend failure.
    fn save_compilation(&self, job: &CodeCompilation) -> Result<(), LabError>;
    /// Fetch a compilation job.
    ///
    /// # Errors
    /// Returns [`LabError::Storage`] on backend failure.
    fn get_compilation(&self, id: CompilationId) -> Result<Option<CodeCompilation>, LabError>;
}

