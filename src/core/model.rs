//! Records owned by the broker.
//!
//! Records reference each other only by identifier; lookups go through the
//! owning component or the [`LabStore`](crate::core::LabStore).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::LabError;
use crate::util::{BookingId, CompilationId, LabId, SessionId, UserId};

/// Availability of a lab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabStatus {
    /// Free for a new session.
    Available,
    /// Occupied by a session.
    Busy,
    /// Taken out of rotation by an operator.
    Maintenance,
    /// Agent stopped reporting; needs an operator to clear.
    Offline,
}

/// Static description of the rig exposed to the client on session start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Board model, e.g. `arduino-uno`.
    pub board: String,
    /// Sensor names the agent reports.
    #[serde(default)]
    pub sensors: Vec<String>,
    /// Actuator names the agent accepts commands for.
    #[serde(default)]
    pub actuators: Vec<String>,
}

/// Agent metrics carried by a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// CPU load in percent.
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    /// Board temperature in degrees Celsius.
    #[serde(default)]
    pub temperature_c: Option<f32>,
    /// Agent uptime in seconds.
    #[serde(default)]
    pub uptime_secs: Option<u64>,
}

/// A physical lab rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lab {
    /// Lab identifier.
    pub id: LabId,
    /// Display name.
    pub name: String,
    /// Current availability.
    pub status: LabStatus,
    /// Owner of the session occupying the lab.
    pub current_user_id: Option<UserId>,
    /// Hard session limit in seconds.
    pub max_session_secs: u64,
    /// Number of users waiting in the live queue.
    pub queue_count: usize,
    /// Whether the agent has sent a heartbeat recently.
    pub is_online: bool,
    /// Time of the last heartbeat (ms since epoch).
    pub last_heartbeat_ms: Option<u128>,
    /// Agent that sent the last heartbeat.
    pub agent_id: Option<String>,
    /// Metrics from the last heartbeat.
    pub last_metrics: Option<AgentMetrics>,
    /// Consecutive sweeps that found the agent silent.
    pub offline_sweeps: u32,
    /// Rig description.
    pub hardware: HardwareConfig,
}

impl Lab {
    /// Create an available, not-yet-online lab.
    pub fn new(id: impl Into<LabId>, name: impl Into<String>, max_session: Duration) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: LabStatus::Available,
            current_user_id: None,
            max_session_secs: max_session.as_secs(),
            queue_count: 0,
            is_online: false,
            last_heartbeat_ms: None,
            agent_id: None,
            last_metrics: None,
            offline_sweeps: 0,
            hardware: HardwareConfig::default(),
        }
    }

    /// Attach a hardware description.
    #[must_use]
    pub fn with_hardware(mut self, hardware: HardwareConfig) -> Self {
        self.hardware = hardware;
        self
    }

    /// Hard session limit.
    #[must_use]
    pub const fn max_session(&self) -> Duration {
        Duration::from_secs(self.max_session_secs)
    }

    /// Whether a new session could start right now.
    #[must_use]
    pub fn is_startable(&self) -> bool {
        self.status == LabStatus::Available && self.is_online
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Lab acquired, waiting for the client to confirm a live connection.
    Requested,
    /// Session is live.
    Active,
    /// Ended normally.
    Completed,
    /// Ran into its hard deadline.
    Expired,
    /// Cancelled before or during use.
    Cancelled,
}

impl SessionStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Cancelled)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The user ended the session.
    UserRequested,
    /// The hard deadline passed.
    Expired,
    /// The agent stopped sending heartbeats.
    HardwareOffline,
    /// Cancelled, including promotions never confirmed.
    Cancelled,
}

impl EndReason {
    /// Terminal status a session lands in for this reason.
    #[must_use]
    pub const fn terminal_status(self) -> SessionStatus {
        match self {
            Self::UserRequested | Self::HardwareOffline => SessionStatus::Completed,
            Self::Expired => SessionStatus::Expired,
            Self::Cancelled => SessionStatus::Cancelled,
        }
    }
}

/// Optional feedback left when ending a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFeedback {
    /// Rating from 1 to 5.
    pub rating: Option<u8>,
    /// Free-text comment.
    pub comment: Option<String>,
}

impl SessionFeedback {
    /// Accepted rating range.
    pub const RATING_RANGE: std::ops::RangeInclusive<u8> = 1..=5;

    /// Check the rating is within [`Self::RATING_RANGE`].
    ///
    /// # Errors
    /// [`LabError::InvalidFeedback`] for an out-of-range rating.
    pub fn validate(&self) -> Result<(), LabError> {
        match self.rating {
            Some(rating) if !Self::RATING_RANGE.contains(&rating) => Err(LabError::InvalidFeedback(
                format!("rating {rating} is outside 1..=5"),
            )),
            _ => Ok(()),
        }
    }
}

/// A lab session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabSession {
    /// Session identifier.
    pub id: SessionId,
    /// Lab the session runs on.
    pub lab_id: LabId,
    /// Session owner.
    pub user_id: UserId,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Time the lab was acquired (ms since epoch).
    pub started_at_ms: u128,
    /// Time the session became active.
    pub activated_at_ms: Option<u128>,
    /// Hard deadline (ms since epoch).
    pub deadline_ms: u128,
    /// Latest time a requested session may be confirmed.
    pub confirm_by_ms: Option<u128>,
    /// Time the session ended.
    pub ended_at_ms: Option<u128>,
    /// Served duration in seconds.
    pub duration_seconds: u64,
    /// Why the session ended.
    pub end_reason: Option<EndReason>,
    /// Status of the most recent compilation job.
    pub compilation_status: Option<CompilationStatus>,
    /// Experience points awarded on end.
    pub xp_earned: u32,
    /// Rating left by the user.
    pub rating: Option<u8>,
    /// Comment left by the user.
    pub feedback: Option<String>,
    /// Token scoping client access to this session's channel.
    pub access_token: String,
    /// Warning thresholds (seconds) already announced.
    #[serde(default)]
    pub warned_thresholds: Vec<u64>,
}

impl LabSession {
    /// Seconds left until the deadline, floored at zero.
    #[must_use]
    pub fn remaining_secs(&self, now_ms: u128) -> u64 {
        if self.status.is_terminal() {
            return 0;
        }
        let left = self.deadline_ms.saturating_sub(now_ms) / 1000;
        u64::try_from(left).unwrap_or(u64::MAX)
    }
}

/// An entry in a lab's live waiting list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabQueueEntry {
    /// Lab being waited for.
    pub lab_id: LabId,
    /// Waiting user.
    pub user_id: UserId,
    /// Dense 1-based position.
    pub position: u32,
    /// Bid; higher ranks first.
    pub bid_amount: i64,
    /// Join time (ms since epoch).
    pub joined_at_ms: u128,
    /// Time after which the entry lapses.
    pub expires_at_ms: u128,
    /// Join order within the queue, breaks ties on identical join times.
    pub sequence: u64,
}

impl LabQueueEntry {
    /// Whether the entry has lapsed at `now_ms`.
    #[must_use]
    pub const fn is_expired(&self, now_ms: u128) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Status of a future booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Requested, not yet confirmed.
    Pending,
    /// Confirmed by the user or operator.
    Confirmed,
    /// The user checked in and is using the lab.
    Active,
    /// Used and finished.
    Completed,
    /// Withdrawn.
    Cancelled,
    /// The window passed without a check-in.
    NoShow,
}

impl BookingStatus {
    /// Whether the booking still claims its window.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::Active)
    }
}

/// A scheduled future reservation, distinct from the live queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabBooking {
    /// Booking identifier.
    pub id: BookingId,
    /// Booked lab.
    pub lab_id: LabId,
    /// Booking owner.
    pub user_id: UserId,
    /// Window start (ms since epoch).
    pub starts_at_ms: u128,
    /// Window end (ms since epoch).
    pub ends_at_ms: u128,
    /// Lifecycle state.
    pub status: BookingStatus,
    /// Session that used the booking.
    pub session_id: Option<SessionId>,
    /// Creation time.
    pub created_at_ms: u128,
}

impl LabBooking {
    /// Whether `[start, end)` overlaps this booking's window.
    #[must_use]
    pub const fn overlaps(&self, start_ms: u128, end_ms: u128) -> bool {
        start_ms < self.ends_at_ms && self.starts_at_ms < end_ms
    }
}

/// Source language of a compilation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeLanguage {
    /// Arduino sketch.
    Arduino,
    /// C++.
    Cpp,
    /// C.
    C,
    /// MicroPython script.
    Micropython,
}

impl CodeLanguage {
    /// Filename used when the client does not supply one.
    #[must_use]
    pub const fn default_filename(self) -> &'static str {
        match self {
            Self::Arduino => "sketch.ino",
            Self::Cpp => "main.cpp",
            Self::C => "main.c",
            Self::Micropython => "main.py",
        }
    }
}

/// Compilation job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilationStatus {
    /// Accepted, not yet dispatched.
    Pending,
    /// Dispatched; the agent is building.
    Compiling,
    /// Build done; flashing the board.
    Uploading,
    /// Flashed successfully.
    Success,
    /// Build, upload, dispatch or timeout failure.
    Failed,
}

impl CompilationStatus {
    /// Whether the job is finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Why a compilation job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The agent reported a build or upload failure.
    Agent,
    /// The upload command could not be handed to the bus.
    Dispatch,
    /// No result arrived within the stall timeout.
    Timeout,
}

/// A build/flash job submitted during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCompilation {
    /// Job identifier.
    pub id: CompilationId,
    /// Session the job was submitted in.
    pub session_id: SessionId,
    /// Lab the job targets.
    pub lab_id: LabId,
    /// Submitting user.
    pub user_id: UserId,
    /// Source text.
    pub code: String,
    /// Source language.
    pub language: CodeLanguage,
    /// Filename on the agent.
    pub filename: String,
    /// Lifecycle state.
    pub status: CompilationStatus,
    /// Submission time.
    pub created_at_ms: u128,
    /// Time the job entered `compiling`.
    pub compile_started_at_ms: Option<u128>,
    /// Time the job entered `uploading`.
    pub upload_started_at_ms: Option<u128>,
    /// Time the job reached a terminal state.
    pub completed_at_ms: Option<u128>,
    /// Time the agent reports the board was flashed.
    pub uploaded_at_ms: Option<u128>,
    /// Last time any transition or result was observed.
    pub last_progress_ms: u128,
    /// Accumulated build output.
    pub output: String,
    /// Accumulated build errors.
    pub errors: String,
    /// Failure cause when `status == Failed`.
    pub failure: Option<FailureReason>,
}

/// Kind of an audited hardware event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareEventKind {
    /// Telemetry received.
    SensorRead,
    /// Actuator command sent.
    ActuatorControl,
    /// Code upload dispatched or result received.
    CodeUpload,
    /// Malformed payload or transport failure.
    Error,
    /// Heartbeat or agent connectivity change.
    Connection,
    /// Session opened on the lab.
    SessionStart,
    /// Session closed on the lab.
    SessionEnd,
}
