//! In-process transport backed by a bounded crossbeam channel.
//!
//! Publishing uses `try_send`: a full or disconnected channel drops the
//! message and reports an error instead of blocking the caller.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::core::protocol::{Envelope, OutboundCommand};
use crate::core::{AgentTransport, LabError};

/// A message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Topic the message was published on.
    pub topic: String,
    /// Encoded envelope.
    pub payload: Vec<u8>,
}

impl Published {
    /// Decode the payload as an outbound command envelope.
    ///
    /// # Errors
    /// Returns [`LabError::Bridge`] for malformed payloads.
    pub fn decode(&self) -> Result<Envelope<OutboundCommand>, LabError> {
        Envelope::decode_command(&self.payload)
    }
}

/// Broker-side half of the channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: Sender<Published>,
}

/// Agent-side half of the channel.
#[derive(Debug, Clone)]
pub struct AgentEndpoint {
    rx: Receiver<Published>,
}

impl ChannelTransport {
    /// Create a transport holding at most `capacity` undelivered messages.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, AgentEndpoint) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, AgentEndpoint { rx })
    }
}

impl AgentTransport for ChannelTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LabError> {
        let msg = Published {
            topic: topic.to_string(),
            payload,
        };
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => LabError::Bridge(format!("transport full, dropped message on {topic}")),
            TrySendError::Disconnected(_) => {
                LabError::Bridge(format!("agent disconnected, dropped message on {topic}"))
            }
        })
    }
}

impl AgentEndpoint {
    /// Take the next message if one is waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<Published> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next message.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Published> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Take every waiting message.
    #[must_use]
    pub fn drain(&self) -> Vec<Published> {
        self.rx.try_iter().collect()
    }
}
