//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::core::model::{CodeCompilation, Lab, LabBooking, LabQueueEntry, LabSession};
use crate::core::{LabError, LabStore};
use crate::util::{BookingId, CompilationId, LabId, SessionId};

#[derive(Default)]
struct Tables {
    labs: HashMap<LabId, Lab>,
    sessions: HashMap<SessionId, LabSession>,
    queues: HashMap<LabId, Vec<LabQueueEntry>>,
    bookings: HashMap<BookingId, LabBooking>,
    compilations: HashMap<CompilationId, CodeCompilation>,
}

/// Simple in-memory store for development and tests. Data is lost on drop.
pub struct InMemoryLabStore {
    open: AtomicBool,
    tables: RwLock<Tables>,
}

impl InMemoryLabStore {
    /// Create an open, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            tables: RwLock::new(Tables::default()),
        }
    }

    /// All stored sessions for a lab, oldest first.
    #[must_use]
    pub fn sessions_for_lab(&self, lab_id: &str) -> Vec<LabSession> {
        let tables = self.tables.read();
        let mut sessions: Vec<_> = tables
            .sessions
            .values()
            .filter(|s| s.lab_id == lab_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.started_at_ms);
        sessions
    }

    /// All stored bookings for a lab.
    #[must_use]
    pub fn bookings_for_lab(&self, lab_id: &str) -> Vec<LabBooking> {
        self.tables
            .read()
            .bookings
            .values()
            .filter(|b| b.lab_id == lab_id)
            .cloned()
            .collect()
    }

    fn ensure_open(&self) -> Result<(), LabError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LabError::Storage("store is closed".into()))
        }
    }
}

impl Default for InMemoryLabStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LabStore for InMemoryLabStore {
    fn open(&self) -> Result<(), LabError> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn save_lab(&self, lab: &Lab) -> Result<(), LabError> {
        self.ensure_open()?;
        self.tables.write().labs.insert(lab.id.clone(), lab.clone());
        Ok(())
    }

    fn load_labs(&self) -> Result<Vec<Lab>, LabError> {
        self.ensure_open()?;
        let mut labs: Vec<_> = self.tables.read().labs.values().cloned().collect();
        labs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(labs)
    }

    fn save_session(&self, session: &LabSession) -> Result<(), LabError> {
        self.ensure_open()?;
        self.tables
            .write()
            .sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    fn get_session(&self, id: SessionId) -> Result<Option<LabSession>, LabError> {
        self.ensure_open()?;
        Ok(self.tables.read().sessions.get(&id).cloned())
    }

    fn recent_session_durations(&self, lab_id: &str, limit: usize) -> Result<Vec<u64>, LabError> {
        self.ensure_open()?;
        let tables = self.tables.read();
        let mut finished: Vec<_> = tables
            .sessions
            .values()
            .filter(|s| s.lab_id == lab_id && s.status.is_terminal() && s.duration_seconds > 0)
            .filter_map(|s| s.ended_at_ms.map(|ended| (ended, s.duration_seconds)))
            .collect();
        finished.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(finished.into_iter().take(limit).map(|(_, d)| d).collect())
    }

    fn save_queue(&self, lab_id: &str, entries: &[LabQueueEntry]) -> Result<(), LabError> {
        self.ensure_open()?;
        self.tables
            .write()
            .queues
            .insert(lab_id.to_string(), entries.to_vec());
        Ok(())
    }

    fn load_queue(&self, lab_id: &str) -> Result<Vec<LabQueueEntry>, LabError> {
        self.ensure_open()?;
        Ok(self
            .tables
            .read()
            .queues
            .get(lab_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_booking(&self, booking: &LabBooking) -> Result<(), LabError> {
        self.ensure_open()?;
        self.tables
            .write()
            .bookings
            .insert(booking.id, booking.clone());
        Ok(())
    }

    fn save_compilation(&self, job: &CodeCompilation) -> Result<(), LabError> {
        self.ensure_open()?;
        self.tables.write().compilations.insert(job.id, job.clone());
        Ok(())
    }

    fn get_compilation(&self, id: CompilationId) -> Result<Option<CodeCompilation>, LabError> {
        self.ensure_open()?;
        Ok(self.tables.read().compilations.get(&id).cloned())
    }
}
