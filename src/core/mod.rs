//! Core reservation, session and hardware orchestration.

pub mod audit;
pub mod booking;
pub mod bridge;
pub mod broker;
pub mod collaborators;
pub mod compilation;
pub mod error;
pub mod events;
pub mod lanes;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod reservation;
pub mod session;
pub mod store;

pub use audit::{build_log_entry, HardwareLogEntry, HardwareLogSink, InMemoryHardwareLog, LogDetail};
pub use booking::BookingLedger;
pub use bridge::{AgentTransport, ChannelDescriptor, HardwareBridge, InboundDispatch};
pub use broker::{JoinOutcome, LabBroker, SweepReport};
pub use collaborators::{forward_events, LoggingSink, NotificationSink, RewardSink, Spawn};
pub use compilation::{CompilationPipeline, CompilationView, ResultOutcome};
pub use error::{AppResult, LabError};
pub use events::{EventBus, LabEvent, RewardEvent};
pub use lanes::LabLanes;
pub use model::{
    AgentMetrics, BookingStatus, CodeCompilation, CodeLanguage, CompilationStatus, EndReason,
    FailureReason, HardwareConfig, HardwareEventKind, Lab, LabBooking, LabQueueEntry, LabSession,
    LabStatus, SessionFeedback, SessionStatus,
};
pub use protocol::{
    ActuatorCommand, Channel, CodeUploadCommand, CompilationResult, Envelope, Heartbeat,
    InboundMessage, OutboundCommand, SensorMessage,
};
pub use registry::{LabLease, LabRegistry, OfflineCheck};
pub use reservation::{AverageSessionPolicy, QueueLimits, QueueTicket, ReservationQueue, WaitPolicy};
pub use session::{
    DeadlineReport, OfflineSweep, SessionHandle, SessionManager, SessionPolicy, SessionSummary,
    XpPolicy,
};
pub use store::LabStore;
