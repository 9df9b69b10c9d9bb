//! Shared fixtures for broker integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lab_broker::builders::BrokerBuilder;
use lab_broker::config::{BrokerConfig, LabConfig};
use lab_broker::core::{
    AgentMetrics, CompilationResult, CompilationStatus, Envelope, HardwareConfig, Heartbeat,
    InboundMessage, LabBroker, LabEvent, SensorMessage,
};
use lab_broker::infra::transport::AgentEndpoint;
use lab_broker::infra::{ChannelTransport, InMemoryLabStore};
use lab_broker::util::{CompilationId, ManualClock, SessionId};
use tokio::sync::broadcast;

/// Fixed start time for every test clock.
pub const START_MS: u128 = 1_700_000_000_000;

/// A broker wired to a manual clock and an in-process agent channel.
pub struct Rig {
    pub broker: Arc<LabBroker>,
    pub clock: Arc<ManualClock>,
    pub agent: AgentEndpoint,
    pub store: Arc<InMemoryLabStore>,
    pub log: lab_broker::core::InMemoryHardwareLog,
}

pub fn lab(name: &str, max_session_secs: u64) -> LabConfig {
    LabConfig {
        name: name.to_string(),
        max_session_secs,
        hardware: HardwareConfig {
            board: "arduino-uno".into(),
            sensors: vec!["temperature".into()],
            actuators: vec!["led1".into()],
        },
    }
}

/// Configuration with the given `(lab_id, max_session_secs)` labs.
pub fn config(labs: &[(&str, u64)]) -> BrokerConfig {
    let labs: HashMap<String, LabConfig> = labs
        .iter()
        .map(|(id, secs)| ((*id).to_string(), lab(&format!("Lab {id}"), *secs)))
        .collect();
    BrokerConfig::with_labs(labs)
}

/// Build a broker and bring every lab online with a first heartbeat.
pub fn rig(cfg: BrokerConfig) -> Rig {
    lab_broker::util::init_tracing();
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = Arc::new(InMemoryLabStore::new());
    let log = lab_broker::core::InMemoryHardwareLog::new(1_000);
    let (transport, agent) = ChannelTransport::bounded(cfg.transport_capacity);
    let lab_ids: Vec<String> = cfg.labs.keys().cloned().collect();

    let broker = BrokerBuilder::new(cfg)
        .transport(transport)
        .store(store.clone())
        .clock(clock.clone())
        .hardware_log(log.clone())
        .build()
        .expect("broker builds");
    let rig = Rig {
        broker: Arc::new(broker),
        clock,
        agent,
        store,
        log,
    };
    for id in lab_ids {
        heartbeat(&rig, &id);
    }
    rig
}

/// Rig with a single lab `lab-1` allowing 1800 s sessions.
pub fn single_lab() -> Rig {
    rig(config(&[("lab-1", 1800)]))
}

/// Config whose agents never go stale within a test.
pub fn steady(labs: &[(&str, u64)]) -> BrokerConfig {
    let mut cfg = config(labs);
    cfg.heartbeat_offline_secs = 86_400;
    cfg
}

fn encode(lab_id: &str, session_id: Option<SessionId>, message: InboundMessage) -> Vec<u8> {
    Envelope {
        lab_id: lab_id.to_string(),
        session_id,
        sent_at: 0,
        message,
    }
    .encode()
    .expect("envelope encodes")
}

pub fn heartbeat_payload(lab_id: &str) -> Vec<u8> {
    encode(
        lab_id,
        None,
        InboundMessage::Heartbeat(Heartbeat {
            agent_id: format!("agent-{lab_id}"),
            status: "ready".into(),
            metrics: AgentMetrics::default(),
        }),
    )
}

pub fn heartbeat(rig: &Rig, lab_id: &str) {
    rig.broker
        .handle_inbound(&format!("labs/{lab_id}/heartbeat"), &heartbeat_payload(lab_id))
        .expect("heartbeat accepted");
}

pub fn sensor_payload(lab_id: &str, session_id: Option<SessionId>, celsius: f64) -> Vec<u8> {
    let mut sensors = BTreeMap::new();
    sensors.insert("temperature".to_string(), serde_json::json!(celsius));
    encode(
        lab_id,
        session_id,
        InboundMessage::Sensor(SensorMessage {
            sensors,
            timestamp: 1,
        }),
    )
}

pub fn result_payload(
    lab_id: &str,
    compilation_id: CompilationId,
    status: CompilationStatus,
    output: Option<&str>,
) -> Vec<u8> {
    encode(
        lab_id,
        None,
        InboundMessage::CompilationResult(CompilationResult {
            compilation_id,
            status,
            output: output.map(str::to_string),
            errors: None,
            uploaded_at: None,
        }),
    )
}

/// Every event currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<LabEvent>) -> Vec<LabEvent> {
    lab_broker::core::events::drain(rx)
}
