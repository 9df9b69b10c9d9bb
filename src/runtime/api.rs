//! Request-facing models and handlers.
//!
//! Transport-agnostic: an HTTP or websocket layer deserializes a request,
//! calls the matching function with the authenticated user id, and
//! serializes the response or [`ApiError`].

use serde::{Deserialize, Serialize};

use crate::core::{
    ActuatorCommand, CodeLanguage, CompilationView, JoinOutcome, Lab, LabBroker, LabError,
    LabStatus, SessionFeedback, SessionHandle, SessionSummary,
};
use crate::util::{CompilationId, LabId, SessionId};

/// Error payload returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable failure tag, see [`LabError::kind`].
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl From<LabError> for ApiError {
    fn from(err: LabError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Join-queue request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinQueueRequest {
    /// Target lab.
    pub lab_id: LabId,
    /// Bid; higher bids are served first.
    #[serde(default)]
    pub bid_amount: i64,
}

/// Request naming only a lab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabRequest {
    /// Target lab.
    pub lab_id: LabId,
}

/// Request naming only a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Target session.
    pub session_id: SessionId,
}

/// End-session request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndSessionRequest {
    /// Session to end.
    pub session_id: SessionId,
    /// Optional rating and comment.
    #[serde(default)]
    pub feedback: Option<SessionFeedback>,
}

/// Code submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitCodeRequest {
    /// Session the code runs in.
    pub session_id: SessionId,
    /// Source code.
    pub code: String,
    /// Source language.
    pub language: CodeLanguage,
    /// File name; derived from the language when absent.
    #[serde(default)]
    pub filename: Option<String>,
}

/// Compilation poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollCompilationRequest {
    /// Job to poll.
    pub compilation_id: CompilationId,
}

/// Actuator command request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorRequest {
    /// Session driving the actuator.
    pub session_id: SessionId,
    /// Command forwarded to the agent.
    #[serde(flatten)]
    pub command: ActuatorCommand,
}

/// Acknowledgement for requests without a richer response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Always `true`.
    pub ok: bool,
}

impl Ack {
    const OK: Self = Self { ok: true };
}

/// Lab listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabSnapshot {
    /// Lab identifier.
    pub id: LabId,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: LabStatus,
    /// Whether the agent is heartbeating.
    pub is_online: bool,
    /// Users waiting.
    pub queue_count: usize,
    /// Session length limit in seconds.
    pub max_session_secs: u64,
}

impl From<Lab> for LabSnapshot {
    fn from(lab: Lab) -> Self {
        Self {
            id: lab.id,
            name: lab.name,
            status: lab.status,
            is_online: lab.is_online,
            queue_count: lab.queue_count,
            max_session_secs: lab.max_session_secs,
        }
    }
}

/// Health response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Registered labs.
    pub labs: usize,
    /// Labs with a live agent.
    pub labs_online: usize,
    /// Sessions currently running or awaiting confirmation.
    pub live_sessions: usize,
    /// Compilation jobs awaiting a result.
    pub compilations_in_flight: usize,
}

/// Join a lab queue, possibly starting a session straight away.
///
/// # Errors
/// See [`LabBroker::join_queue`].
pub fn join_queue(broker: &LabBroker, user_id: &str, req: &JoinQueueRequest) -> Result<JoinOutcome, ApiError> {
    Ok(broker.join_queue(&req.lab_id, user_id, req.bid_amount)?)
}

/// Leave a lab queue.
///
/// # Errors
/// `not_queued` when the user holds no entry.
pub fn leave_queue(broker: &LabBroker, user_id: &str, req: &LabRequest) -> Result<Ack, ApiError> {
    broker.leave_queue(&req.lab_id, user_id)?;
    Ok(Ack::OK)
}

/// Start a session on an idle lab.
///
/// # Errors
/// See [`LabBroker::start_session`].
pub fn start_session(broker: &LabBroker, user_id: &str, req: &LabRequest) -> Result<SessionHandle, ApiError> {
    Ok(broker.start_session(&req.lab_id, user_id)?)
}

/// Confirm a promotion.
///
/// # Errors
/// See [`LabBroker::confirm_session`].
pub fn confirm_session(broker: &LabBroker, user_id: &str, req: &SessionRequest) -> Result<SessionHandle, ApiError> {
    Ok(broker.confirm_session(req.session_id, user_id)?)
}

/// End a session at the user's request.
///
/// # Errors
/// See [`LabBroker::end_session`].
pub fn end_session(broker: &LabBroker, user_id: &str, req: EndSessionRequest) -> Result<SessionSummary, ApiError> {
    Ok(broker.end_session(req.session_id, user_id, req.feedback)?)
}

/// Submit code for build and flash.
///
/// # Errors
/// See [`LabBroker::submit_code`].
pub fn submit_code(broker: &LabBroker, user_id: &str, req: SubmitCodeRequest) -> Result<CompilationView, ApiError> {
    Ok(broker.submit_code(req.session_id, user_id, req.code, req.language, req.filename)?)
}

/// Poll a compilation job.
///
/// # Errors
/// `compilation_not_found` for unknown jobs or jobs owned by someone else.
pub fn poll_compilation(
    broker: &LabBroker,
    user_id: &str,
    req: &PollCompilationRequest,
) -> Result<CompilationView, ApiError> {
    Ok(broker.poll_compilation(req.compilation_id, user_id)?)
}

/// Drive an actuator.
///
/// # Errors
/// See [`LabBroker::send_actuator`].
pub fn send_actuator(broker: &LabBroker, user_id: &str, req: ActuatorRequest) -> Result<Ack, ApiError> {
    broker.send_actuator(req.session_id, user_id, req.command)?;
    Ok(Ack::OK)
}

/// List every lab.
#[must_use]
pub fn list_labs(broker: &LabBroker) -> Vec<LabSnapshot> {
    broker.list_labs().into_iter().map(LabSnapshot::from).collect()
}

/// Return a health payload.
#[must_use]
pub fn health(broker: &LabBroker) -> Health {
    let labs = broker.list_labs();
    Health {
        ok: true,
        labs: labs.len(),
        labs_online: labs.iter().filter(|lab| lab.is_online).count(),
        live_sessions: broker.sessions().live_count(),
        compilations_in_flight: broker.pipeline().in_flight(),
    }
}
