//! Remote build/flash jobs: `pending → compiling → uploading → {success, failed}`.
//!
//! Jobs are dispatched once; there is no retry. Agent results are applied
//! only when they move a job forward, and anything arriving after a job is
//! terminal is ignored, so duplicate deliveries are harmless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::bridge::HardwareBridge;
use crate::core::events::{EventBus, LabEvent};
use crate::core::model::{CodeCompilation, CodeLanguage, CompilationStatus, FailureReason};
use crate::core::protocol::{CodeUploadCommand, CompilationResult};
use crate::core::registry::LabRegistry;
use crate::core::session::SessionManager;
use crate::core::{LabError, LabStore};
use crate::util::{duration_ms, new_id, CompilationId, SessionId, SharedClock};

const TIMEOUT_MESSAGE: &str = "compilation timed out";

/// Polling view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationView {
    /// Job identifier.
    pub compilation_id: CompilationId,
    /// Session the job belongs to.
    pub session_id: SessionId,
    /// Current status.
    pub status: CompilationStatus,
    /// Accumulated build output.
    pub output: String,
    /// Accumulated build errors.
    pub errors: String,
    /// Time the board was flashed.
    pub uploaded_at_ms: Option<u128>,
    /// Failure cause.
    pub failure: Option<FailureReason>,
}

impl From<&CodeCompilation> for CompilationView {
    fn from(job: &CodeCompilation) -> Self {
        Self {
            compilation_id: job.id,
            session_id: job.session_id,
            status: job.status,
            output: job.output.clone(),
            errors: job.errors.clone(),
            uploaded_at_ms: job.uploaded_at_ms,
            failure: job.failure,
        }
    }
}

/// What happened to an agent result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    /// The job changed; carries its status afterwards.
    Applied(CompilationStatus),
    /// Duplicate, stale or backwards result; nothing changed.
    Ignored,
}

/// Append a reported chunk. With `redelivery_guard` set, a chunk the buffer
/// already ends with is taken as a redelivered progress message.
fn append(buf: &mut String, chunk: Option<&str>, redelivery_guard: bool) -> bool {
    match chunk.filter(|c| !c.is_empty()) {
        Some(c) if redelivery_guard && buf.ends_with(c) => false,
        Some(c) => {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(c);
            true
        }
        None => false,
    }
}

/// Tracker for compilation jobs.
pub struct CompilationPipeline {
    jobs: RwLock<HashMap<CompilationId, Arc<Mutex<CodeCompilation>>>>,
    sessions: Arc<SessionManager>,
    registry: Arc<LabRegistry>,
    bridge: Arc<HardwareBridge>,
    store: Arc<dyn LabStore>,
    clock: SharedClock,
    events: EventBus,
    stall_timeout: Duration,
}

impl CompilationPipeline {
    /// Create a pipeline. Jobs without agent progress for `stall_timeout`
    /// are failed by [`sweep_stalled`](Self::sweep_stalled).
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<LabRegistry>,
        bridge: Arc<HardwareBridge>,
        store: Arc<dyn LabStore>,
        clock: SharedClock,
        events: EventBus,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            sessions,
            registry,
            bridge,
            store,
            clock,
            events,
            stall_timeout,
        }
    }

    fn announce(&self, job: &CodeCompilation) {
        self.events.publish(LabEvent::CompilationStatusChanged {
            compilation_id: job.id,
            session_id: job.session_id,
            status: job.status,
        });
        if let Err(e) = self.sessions.record_compilation(job.session_id, job.status) {
            tracing::error!(session_id = %job.session_id, error = %e, "failed to snapshot compilation status");
        }
    }

    /// Submit code in an active session and dispatch it to the agent.
    ///
    /// A dispatch failure is not an error for the caller: the job is
    /// returned already `failed` and must be resubmitted as a new job.
    ///
    /// # Errors
    /// [`LabError::SessionNotActive`], [`LabError::SessionAlreadyTerminal`],
    /// [`LabError::SessionNotFound`], [`LabError::HardwareOffline`] or
    /// [`LabError::Storage`].
    pub fn submit(
        &self,
        session_id: SessionId,
        code: String,
        language: CodeLanguage,
        filename: Option<String>,
    ) -> Result<CompilationView, LabError> {
        let lab_id = self.sessions.get(session_id)?.lab_id;
        let lane = self.sessions.lanes().lane(&lab_id);
        let _guard = lane.lock();
        let session = self.sessions.require_active(session_id)?;
        let lab = self.registry.get(&session.lab_id)?;
        if !lab.is_online {
            return Err(LabError::HardwareOffline(lab.id));
        }

        let now = self.clock.now_ms();
        let filename = filename
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| language.default_filename().to_string());
        let mut job = CodeCompilation {
            id: new_id(),
            session_id,
            lab_id: session.lab_id.clone(),
            user_id: session.user_id.clone(),
            code,
            language,
            filename,
            status: CompilationStatus::Pending,
            created_at_ms: now,
            compile_started_at_ms: None,
            upload_started_at_ms: None,
            completed_at_ms: None,
            uploaded_at_ms: None,
            last_progress_ms: now,
            output: String::new(),
            errors: String::new(),
            failure: None,
        };
        self.store.save_compilation(&job)?;

        let command = CodeUploadCommand {
            compilation_id: job.id,
            code: job.code.clone(),
            language,
            filename: job.filename.clone(),
        };
        match self.bridge.send_code_upload(&job.lab_id, session_id, command) {
            Ok(()) => {
                job.status = CompilationStatus::Compiling;
                job.compile_started_at_ms = Some(now);
                tracing::info!(compilation_id = %job.id, lab_id = %job.lab_id, ?language, "compilation dispatched");
            }
            Err(e) => {
                job.status = CompilationStatus::Failed;
                job.failure = Some(FailureReason::Dispatch);
                job.errors = e.to_string();
                job.completed_at_ms = Some(now);
                tracing::warn!(compilation_id = %job.id, error = %e, "compilation dispatch failed");
            }
        }
        self.store.save_compilation(&job)?;
        self.announce(&job);

        let view = CompilationView::from(&job);
        if !job.status.is_terminal() {
            self.jobs.write().insert(job.id, Arc::new(Mutex::new(job)));
        }
        Ok(view)
    }

    /// Apply an agent result reported by `lab_id`.
    ///
    /// # Errors
    /// [`LabError::CompilationNotFound`] for unknown jobs,
    /// [`LabError::Storage`] on write failure.
    pub fn on_result(&self, lab_id: &str, result: &CompilationResult) -> Result<ResultOutcome, LabError> {
        let id = result.compilation_id;
        let Some(entry) = self.jobs.read().get(&id).cloned() else {
            return match self.store.get_compilation(id)? {
                Some(_) => {
                    tracing::debug!(compilation_id = %id, "result for finished job ignored");
                    Ok(ResultOutcome::Ignored)
                }
                None => Err(LabError::CompilationNotFound(id)),
            };
        };

        let mut job = entry.lock();
        if job.lab_id != lab_id {
            tracing::warn!(compilation_id = %id, lab_id, owner = %job.lab_id, "result from foreign lab ignored");
            return Ok(ResultOutcome::Ignored);
        }
        if job.status.is_terminal() {
            return Ok(ResultOutcome::Ignored);
        }

        let now = self.clock.now_ms();
        let mut next = job.clone();
        let advanced = result.status > job.status;
        if advanced {
            next.status = result.status;
            match result.status {
                CompilationStatus::Compiling => {
                    next.compile_started_at_ms.get_or_insert(now);
                }
                CompilationStatus::Uploading => {
                    next.upload_started_at_ms = Some(now);
                }
                CompilationStatus::Success | CompilationStatus::Failed => {
                    next.completed_at_ms = Some(now);
                    if result.status == CompilationStatus::Failed {
                        next.failure = Some(FailureReason::Agent);
                    }
                }
                CompilationStatus::Pending => {}
            }
        }
        let mut touched = advanced;
        touched |= append(&mut next.output, result.output.as_deref(), !advanced);
        touched |= append(&mut next.errors, result.errors.as_deref(), !advanced);
        if let Some(at) = result.uploaded_at {
            next.uploaded_at_ms = Some(u128::from(at));
            touched = true;
        }
        if !touched {
            return Ok(ResultOutcome::Ignored);
        }
        next.last_progress_ms = now;

        self.store.save_compilation(&next)?;
        *job = next;
        let snapshot = job.clone();
        drop(job);

        if snapshot.status.is_terminal() {
            self.jobs.write().remove(&id);
            tracing::info!(compilation_id = %id, status = ?snapshot.status, "compilation finished");
        }
        if advanced {
            self.announce(&snapshot);
        }
        Ok(ResultOutcome::Applied(snapshot.status))
    }

    /// Current state of a job.
    ///
    /// # Errors
    /// [`LabError::CompilationNotFound`] or [`LabError::Storage`].
    pub fn status_of(&self, id: CompilationId) -> Result<CompilationView, LabError> {
        if let Some(entry) = self.jobs.read().get(&id) {
            return Ok(CompilationView::from(&*entry.lock()));
        }
        self.store
            .get_compilation(id)?
            .map(|job| CompilationView::from(&job))
            .ok_or(LabError::CompilationNotFound(id))
    }

    /// Full job record, including the submitted source.
    ///
    /// # Errors
    /// [`LabError::CompilationNotFound`] or [`LabError::Storage`].
    pub fn job(&self, id: CompilationId) -> Result<CodeCompilation, LabError> {
        if let Some(entry) = self.jobs.read().get(&id) {
            return Ok(entry.lock().clone());
        }
        self.store
            .get_compilation(id)?
            .ok_or(LabError::CompilationNotFound(id))
    }

    /// Fail jobs that saw no agent progress within the stall timeout.
    pub fn sweep_stalled(&self) -> Vec<CompilationId> {
        let now = self.clock.now_ms();
        let limit = duration_ms(self.stall_timeout);
        let open: Vec<_> = self.jobs.read().values().cloned().collect();
        let mut failed = Vec::new();

        for entry in open {
            let mut job = entry.lock();
            if job.status.is_terminal() || now.saturating_sub(job.last_progress_ms) <= limit {
                continue;
            }
            let mut next = job.clone();
            next.status = CompilationStatus::Failed;
            next.failure = Some(FailureReason::Timeout);
            next.completed_at_ms = Some(now);
            append(&mut next.errors, Some(TIMEOUT_MESSAGE), false);
            if let Err(e) = self.store.save_compilation(&next) {
                tracing::error!(compilation_id = %next.id, error = %e, "failed to persist stalled job");
                continue;
            }
            *job = next;
            let snapshot = job.clone();
            drop(job);

            tracing::warn!(
                compilation_id = %snapshot.id,
                lab_id = %snapshot.lab_id,
                error = %LabError::CompilationTimeout(snapshot.id),
                "stalled compilation failed"
            );
            self.announce(&snapshot);
            failed.push(snapshot.id);
        }

        if !failed.is_empty() {
            let mut jobs = self.jobs.write();
            for id in &failed {
                jobs.remove(id);
            }
        }
        failed
    }

    /// Number of jobs still waiting for the agent.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.jobs.read().len()
    }
}
