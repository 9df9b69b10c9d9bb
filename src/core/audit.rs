//! Hardware audit log.
//!
//! Every inbound and outbound bridge event is appended here. Entries are
//! write-once; sinks only ever append.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::model::HardwareEventKind;
use crate::core::protocol::{InboundMessage, OutboundCommand};
use crate::util::{new_id, LabId, LogId, SessionId};

/// Typed body of a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", content = "body", rename_all = "snake_case")]
pub enum LogDetail {
    /// Message received from the agent.
    Inbound(InboundMessage),
    /// Command sent to the agent.
    Outbound(OutboundCommand),
    /// Free-form note (lifecycle events, errors).
    Note(String),
}

/// One audited hardware event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareLogEntry {
    /// Entry identifier.
    pub id: LogId,
    /// Lab the event concerns.
    pub lab_id: LabId,
    /// Session bound at the time, if any.
    pub session_id: Option<SessionId>,
    /// Event kind.
    pub event: HardwareEventKind,
    /// Event body.
    pub detail: LogDetail,
    /// Whether the event was dropped instead of delivered.
    pub dropped: bool,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
}

/// Append-only sink for hardware events.
pub trait HardwareLogSink: Send {
    /// Append an entry.
    fn record(&mut self, entry: HardwareLogEntry);
}

/// Bounded in-memory log; clones share the same buffer.
#[derive(Debug, Clone)]
pub struct InMemoryHardwareLog {
    entries: Arc<Mutex<VecDeque<HardwareLogEntry>>>,
    max_entries: usize,
}

impl InMemoryHardwareLog {
    /// Create a log that keeps at most `max_entries`, dropping the oldest.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries.min(1024)))),
            max_entries,
        }
    }

    /// Snapshot of all retained entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<HardwareLogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Entries for one lab, oldest first.
    #[must_use]
    pub fn for_lab(&self, lab_id: &str) -> Vec<HardwareLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.lab_id == lab_id)
            .cloned()
            .collect()
    }

    /// Entries for one session, oldest first.
    #[must_use]
    pub fn for_session(&self, session_id: SessionId) -> Vec<HardwareLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.session_id == Some(session_id))
            .cloned()
            .collect()
    }
}

impl HardwareLogSink for InMemoryHardwareLog {
    fn record(&mut self, entry: HardwareLogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Build a log entry stamped with `created_at_ms`.
pub fn build_log_entry(
    lab_id: impl Into<LabId>,
    session_id: Option<SessionId>,
    event: HardwareEventKind,
    detail: LogDetail,
    created_at_ms: u128,
) -> HardwareLogEntry {
    HardwareLogEntry {
        id: new_id(),
        lab_id: lab_id.into(),
        session_id,
        event,
        detail,
        dropped: false,
        created_at_ms,
    }
}
