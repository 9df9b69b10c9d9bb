//! Hardware bridge: typed, lab-scoped messaging with the rig agents.
//!
//! Outbound sends are fire-and-forget through an [`AgentTransport`]; the
//! bridge never retries. Each lab channel is bound to at most one session at
//! a time, and telemetry that arrives while nothing is bound is dropped.
//! Every inbound and outbound event lands in the hardware log.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::audit::{build_log_entry, HardwareLogSink, LogDetail};
use crate::core::events::{EventBus, LabEvent};
use crate::core::model::HardwareEventKind;
use crate::core::protocol::{
    ActuatorCommand, Channel, CodeUploadCommand, CompilationResult, Envelope, Heartbeat,
    InboundMessage, OutboundCommand, SensorMessage,
};
use crate::core::LabError;
use crate::util::{LabId, SessionId, SharedClock};

/// Message bus the bridge publishes on.
///
/// Implementations must not block; a message that cannot be handed off is
/// reported as [`LabError::Bridge`] and dropped.
pub trait AgentTransport: Send + Sync {
    /// Publish `payload` on `topic`.
    ///
    /// # Errors
    /// [`LabError::Bridge`] if the bus refused the message.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LabError>;
}

/// Topics a client session may use on its lab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Lab the channel belongs to.
    pub lab_id: LabId,
    /// Session bound to the channel.
    pub session_id: SessionId,
    /// Telemetry topic.
    pub sensors_topic: String,
    /// Actuator command topic.
    pub actuator_topic: String,
    /// Code upload topic.
    pub code_topic: String,
}

impl ChannelDescriptor {
    /// Descriptor for `session_id` on `lab_id`.
    #[must_use]
    pub fn new(lab_id: &str, session_id: SessionId) -> Self {
        Self {
            lab_id: lab_id.to_string(),
            session_id,
            sensors_topic: Channel::Sensors.topic(lab_id),
            actuator_topic: Channel::Actuator.topic(lab_id),
            code_topic: Channel::Code.topic(lab_id),
        }
    }
}

/// Inbound message after decoding and routing.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundDispatch {
    /// Telemetry; `session_id` is `None` when it was dropped.
    Sensor {
        /// Reporting lab.
        lab_id: LabId,
        /// Session the data was delivered to.
        session_id: Option<SessionId>,
    },
    /// Build/flash outcome for the compilation pipeline.
    CompilationResult {
        /// Reporting lab.
        lab_id: LabId,
        /// Reported result.
        result: CompilationResult,
    },
    /// Agent liveness for the registry.
    Heartbeat {
        /// Reporting lab.
        lab_id: LabId,
        /// Heartbeat body.
        heartbeat: Heartbeat,
    },
}

/// Hardware bridge.
pub struct HardwareBridge {
    transport: Arc<dyn AgentTransport>,
    log: Mutex<Box<dyn HardwareLogSink>>,
    bindings: RwLock<HashMap<LabId, SessionId>>,
    clock: SharedClock,
    events: EventBus,
}

impl HardwareBridge {
    /// Create a bridge over `transport`, auditing into `log`.
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        log: Box<dyn HardwareLogSink>,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        Self {
            transport,
            log: Mutex::new(log),
            bindings: RwLock::new(HashMap::new()),
            clock,
            events,
        }
    }

    fn audit(
        &self,
        lab_id: &str,
        session_id: Option<SessionId>,
        event: HardwareEventKind,
        detail: LogDetail,
        dropped: bool,
    ) {
        let mut entry = build_log_entry(lab_id, session_id, event, detail, self.clock.now_ms());
        entry.dropped = dropped;
        self.log.lock().record(entry);
    }

    fn sent_at(&self) -> u64 {
        u64::try_from(self.clock.now_ms()).unwrap_or(u64::MAX)
    }

    /// Bind the lab channel to `session_id`, replacing any stale binding.
    pub fn open_channel(&self, lab_id: &str, session_id: SessionId) -> ChannelDescriptor {
        let previous = self
            .bindings
            .write()
            .insert(lab_id.to_string(), session_id);
        if let Some(stale) = previous.filter(|s| *s != session_id) {
            tracing::warn!(lab_id, %stale, "replacing stale channel binding");
        }
        self.audit(
            lab_id,
            Some(session_id),
            HardwareEventKind::SessionStart,
            LogDetail::Note("channel opened".into()),
            false,
        );
        tracing::debug!(lab_id, %session_id, "channel opened");
        ChannelDescriptor::new(lab_id, session_id)
    }

    /// Unbind the lab channel if it is still bound to `session_id`.
    pub fn close_channel(&self, lab_id: &str, session_id: SessionId) -> bool {
        let closed = {
            let mut bindings = self.bindings.write();
            if bindings.get(lab_id) == Some(&session_id) {
                bindings.remove(lab_id);
                true
            } else {
                false
            }
        };
        if closed {
            self.audit(
                lab_id,
                Some(session_id),
                HardwareEventKind::SessionEnd,
                LogDetail::Note("channel closed".into()),
                false,
            );
            tracing::debug!(lab_id, %session_id, "channel closed");
        }
        closed
    }

    /// Session currently bound to the lab channel.
    #[must_use]
    pub fn bound_session(&self, lab_id: &str) -> Option<SessionId> {
        self.bindings.read().get(lab_id).copied()
    }

    fn send(
        &self,
        lab_id: &str,
        session_id: SessionId,
        command: OutboundCommand,
        event: HardwareEventKind,
    ) -> Result<(), LabError> {
        let topic = command.channel().topic(lab_id);
        let envelope = Envelope {
            lab_id: lab_id.to_string(),
            session_id: Some(session_id),
            sent_at: self.sent_at(),
            message: command,
        };
        let outcome = envelope
            .encode()
            .and_then(|payload| self.transport.publish(&topic, payload));
        let dropped = outcome.is_err();
        self.audit(
            lab_id,
            Some(session_id),
            event,
            LogDetail::Outbound(envelope.message),
            dropped,
        );
        if let Err(e) = &outcome {
            tracing::error!(lab_id, %session_id, topic = %topic, error = %e, "outbound command dropped");
        }
        outcome
    }

    /// Send an actuator command on behalf of the bound session.
    ///
    /// # Errors
    /// [`LabError::SessionNotActive`] if `session_id` is not bound to the lab,
    /// [`LabError::Bridge`] if the transport refused the message.
    pub fn send_actuator(
        &self,
        lab_id: &str,
        session_id: SessionId,
        command: ActuatorCommand,
    ) -> Result<(), LabError> {
        if self.bound_session(lab_id) != Some(session_id) {
            return Err(LabError::SessionNotActive(session_id));
        }
        self.send(
            lab_id,
            session_id,
            OutboundCommand::Actuator(command),
            HardwareEventKind::ActuatorControl,
        )
    }

    /// Dispatch a code upload on behalf of the bound session.
    ///
    /// # Errors
    /// [`LabError::SessionNotActive`] if `session_id` is not bound to the lab,
    /// [`LabError::Bridge`] if the transport refused the message.
    pub fn send_code_upload(
        &self,
        lab_id: &str,
        session_id: SessionId,
        command: CodeUploadCommand,
    ) -> Result<(), LabError> {
        if self.bound_session(lab_id) != Some(session_id) {
            return Err(LabError::SessionNotActive(session_id));
        }
        self.send(
            lab_id,
            session_id,
            OutboundCommand::CodeUpload(command),
            HardwareEventKind::CodeUpload,
        )
    }

    fn reject(&self, lab_id: &str, topic: &str, err: LabError) -> LabError {
        self.audit(
            lab_id,
            None,
            HardwareEventKind::Error,
            LogDetail::Note(err.to_string()),
            true,
        );
        tracing::warn!(topic, error = %err, "rejected inbound payload");
        err
    }

    /// Decode an inbound payload received on `topic` and route it.
    ///
    /// The topic decides which lab the message belongs to; an envelope that
    /// names another lab, or a message type that does not belong on the
    /// topic's channel, is rejected. Telemetry is forwarded to the bound
    /// session right here; compilation results and heartbeats are handed
    /// back for the owning component.
    ///
    /// # Errors
    /// [`LabError::Bridge`] for malformed payloads, unroutable topics and
    /// envelopes that disagree with their topic; the failure is logged as an
    /// `error` event against the topic's lab.
    pub fn receive(&self, topic: &str, payload: &[u8]) -> Result<InboundDispatch, LabError> {
        let route = Channel::parse_topic(topic);
        let topic_lab = route.map_or("unknown", |(lab, _)| lab);
        let envelope = Envelope::<InboundMessage>::decode(payload)
            .map_err(|e| self.reject(topic_lab, topic, e))?;
        let Some((topic_lab, channel)) = route else {
            return Err(self.reject(
                topic_lab,
                topic,
                LabError::Bridge(format!("unroutable topic {topic}")),
            ));
        };
        if envelope.lab_id != topic_lab {
            return Err(self.reject(
                topic_lab,
                topic,
                LabError::Bridge(format!(
                    "envelope for lab {} arrived on {topic}",
                    envelope.lab_id
                )),
            ));
        }
        if envelope.message.channel() != channel {
            return Err(self.reject(
                topic_lab,
                topic,
                LabError::Bridge(format!(
                    "{} message arrived on {topic}",
                    envelope.message.channel().as_str()
                )),
            ));
        }

        let Envelope {
            lab_id,
            session_id,
            message,
            ..
        } = envelope;
        match message {
            InboundMessage::Sensor(reading) => {
                let delivered = self.route_sensor(&lab_id, session_id, reading);
                Ok(InboundDispatch::Sensor {
                    lab_id,
                    session_id: delivered,
                })
            }
            InboundMessage::CompilationResult(result) => {
                let bound = self.bound_session(&lab_id);
                self.audit(
                    &lab_id,
                    bound,
                    HardwareEventKind::CodeUpload,
                    LogDetail::Inbound(InboundMessage::CompilationResult(result.clone())),
                    false,
                );
                Ok(InboundDispatch::CompilationResult { lab_id, result })
            }
            InboundMessage::Heartbeat(heartbeat) => {
                self.audit(
                    &lab_id,
                    None,
                    HardwareEventKind::Connection,
                    LogDetail::Inbound(InboundMessage::Heartbeat(heartbeat.clone())),
                    false,
                );
                Ok(InboundDispatch::Heartbeat { lab_id, heartbeat })
            }
        }
    }

    /// Forward telemetry to the session bound to the lab.
    ///
    /// Readings addressed to a different session than the bound one are
    /// stale and dropped with the rest. Returns the receiving session.
    pub fn route_sensor(
        &self,
        lab_id: &str,
        addressed_to: Option<SessionId>,
        reading: SensorMessage,
    ) -> Option<SessionId> {
        let bound = self.bound_session(lab_id);
        let target = match (bound, addressed_to) {
            (Some(b), Some(a)) if a != b => None,
            (b, _) => b,
        };
        self.audit(
            lab_id,
            target,
            HardwareEventKind::SensorRead,
            LogDetail::Inbound(InboundMessage::Sensor(reading.clone())),
            target.is_none(),
        );
        match target {
            Some(session_id) => {
                self.events.publish(LabEvent::SensorData {
                    lab_id: lab_id.to_string(),
                    session_id,
                    sensors: reading.sensors,
                    timestamp: reading.timestamp,
                });
                Some(session_id)
            }
            None => {
                tracing::debug!(lab_id, "sensor data dropped, no bound session");
                None
            }
        }
    }

    /// Append a lifecycle note to the hardware log.
    pub fn note(&self, lab_id: &str, session_id: Option<SessionId>, event: HardwareEventKind, text: &str) {
        self.audit(lab_id, session_id, event, LogDetail::Note(text.to_string()), false);
    }
}
