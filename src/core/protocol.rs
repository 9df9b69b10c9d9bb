//! Wire protocol between the broker and lab agents.
//!
//! Every message travels in an [`Envelope`] on a lab-scoped topic
//! (`labs/{lab_id}/{channel}`) and is encoded as JSON. Wire timestamps are
//! `u64` milliseconds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::model::{AgentMetrics, CodeLanguage, CompilationStatus};
use crate::core::LabError;
use crate::util::{CompilationId, LabId, SessionId};

/// Logical channel within a lab's topic space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Agent → broker telemetry.
    Sensors,
    /// Broker → agent actuator commands.
    Actuator,
    /// Broker → agent code uploads.
    Code,
    /// Agent → broker compilation results.
    Compilation,
    /// Agent → broker liveness.
    Heartbeat,
}

impl Channel {
    /// Topic suffix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sensors => "sensors",
            Self::Actuator => "actuator",
            Self::Code => "code",
            Self::Compilation => "compilation",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Full topic for `lab_id`.
    #[must_use]
    pub fn topic(self, lab_id: &str) -> String {
        format!("labs/{lab_id}/{}", self.as_str())
    }

    /// Channel named by a topic suffix.
    #[must_use]
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        [
            Self::Sensors,
            Self::Actuator,
            Self::Code,
            Self::Compilation,
            Self::Heartbeat,
        ]
        .into_iter()
        .find(|channel| channel.as_str() == suffix)
    }

    /// Split a `labs/{lab_id}/{channel}` topic.
    #[must_use]
    pub fn parse_topic(topic: &str) -> Option<(&str, Self)> {
        let mut parts = topic.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("labs"), Some(lab), Some(suffix), None) if !lab.is_empty() => {
                Self::from_suffix(suffix).map(|channel| (lab, channel))
            }
            _ => None,
        }
    }
}

/// Command driving an actuator on the rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    /// Actuator name, e.g. `led1`.
    pub actuator: String,
    /// Action, e.g. `on`, `set`.
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Request for the agent to build and flash code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUploadCommand {
    /// Job the result must be correlated to.
    pub compilation_id: CompilationId,
    /// Source text.
    pub code: String,
    /// Source language.
    pub language: CodeLanguage,
    /// Filename on the agent.
    pub filename: String,
}

/// Telemetry snapshot from the rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMessage {
    /// Sensor name to reading.
    pub sensors: BTreeMap<String, serde_json::Value>,
    /// Agent-side timestamp (ms since epoch).
    pub timestamp: u64,
}

/// Build/flash outcome reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationResult {
    /// Job the result belongs to.
    pub compilation_id: CompilationId,
    /// Reported status; may be an intermediate step.
    pub status: CompilationStatus,
    /// Build output.
    #[serde(default)]
    pub output: Option<String>,
    /// Build errors.
    #[serde(default)]
    pub errors: Option<String>,
    /// Time the board was flashed.
    #[serde(default)]
    pub uploaded_at: Option<u64>,
}

/// Agent liveness report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Reporting agent.
    pub agent_id: String,
    /// Free-form agent status, e.g. `ready`.
    pub status: String,
    /// Agent metrics.
    #[serde(default)]
    pub metrics: AgentMetrics,
}

/// Messages the broker sends to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundCommand {
    /// Drive an actuator.
    Actuator(ActuatorCommand),
    /// Build and flash code.
    CodeUpload(CodeUploadCommand),
}

impl OutboundCommand {
    /// Channel the command is published on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self {
            Self::Actuator(_) => Channel::Actuator,
            Self::CodeUpload(_) => Channel::Code,
        }
    }
}

/// Messages an agent sends to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Telemetry.
    Sensor(SensorMessage),
    /// Build/flash outcome.
    CompilationResult(CompilationResult),
    /// Liveness.
    Heartbeat(Heartbeat),
}

impl InboundMessage {
    /// Channel the message arrives on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self {
            Self::Sensor(_) => Channel::Sensors,
            Self::CompilationResult(_) => Channel::Compilation,
            Self::Heartbeat(_) => Channel::Heartbeat,
        }
    }
}

/// JSON envelope keyed by lab and, when bound, session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    /// Lab the message concerns.
    pub lab_id: LabId,
    /// Session the message is scoped to.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Sender timestamp (ms since epoch).
    pub sent_at: u64,
    /// Message body.
    pub message: T,
}

impl<T: Serialize> Envelope<T> {
    /// Encode as JSON bytes.
    ///
    /// # Errors
    /// Returns [`LabError::Bridge`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, LabError> {
        serde_json::to_vec(self).map_err(|e| LabError::Bridge(format!("encode failed: {e}")))
    }
}

impl Envelope<InboundMessage> {
    /// Decode an inbound agent payload.
    ///
    /// # Errors
    /// Returns [`LabError::Bridge`] for malformed JSON or unknown message types.
    pub fn decode(bytes: &[u8]) -> Result<Self, LabError> {
        serde_json::from_slice(bytes).map_err(|e| LabError::Bridge(format!("malformed payload: {e}")))
    }
}

impl Envelope<OutboundCommand> {
    /// Decode an outbound command, as an agent would.
    ///
    /// # Errors
    /// Returns [`LabError::Bridge`] for malformed JSON.
    pub fn decode_command(bytes: &[u8]) -> Result<Self, LabError> {
        serde_json::from_slice(bytes).map_err(|e| LabError::Bridge(format!("malformed command: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        assert_eq!(Channel::Sensors.topic("lab-1"), "labs/lab-1/sensors");
        assert_eq!(Channel::Code.topic("lab-1"), "labs/lab-1/code");
    }

    #[test]
    fn test_parse_topic() {
        assert_eq!(
            Channel::parse_topic("labs/lab-1/heartbeat"),
            Some(("lab-1", Channel::Heartbeat))
        );
        assert_eq!(
            Channel::parse_topic(&Channel::Compilation.topic("rig-7")),
            Some(("rig-7", Channel::Compilation))
        );
        assert_eq!(Channel::parse_topic("labs//sensors"), None);
        assert_eq!(Channel::parse_topic("labs/lab-1/telemetry"), None);
        assert_eq!(Channel::parse_topic("labs/lab-1/sensors/extra"), None);
        assert_eq!(Channel::parse_topic("devices/lab-1/sensors"), None);
    }

    #[test]
    fn test_decode_tagged_heartbeat() {
        let json = r#"{
            "labId": "lab-1",
            "sentAt": 42,
            "message": {"type": "heartbeat", "agent_id": "agent-7", "status": "ready"}
        }"#;
        let env = Envelope::decode(json.as_bytes()).unwrap();
        assert_eq!(env.lab_id, "lab-1");
        assert!(env.session_id.is_none());
        match env.message {
            InboundMessage::Heartbeat(hb) => assert_eq!(hb.agent_id, "agent-7"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let json = r#"{"labId": "lab-1", "sentAt": 1, "message": {"type": "reboot"}}"#;
        let err = Envelope::decode(json.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "bridge");
    }
}
