//! Integration tests for agent traffic: telemetry routing, actuator
//! commands and the hardware audit log.

mod common;

use std::collections::BTreeMap;

use std::time::Duration;

use common::{config, drain, heartbeat, heartbeat_payload, rig, sensor_payload, steady};
use lab_broker::core::{
    ActuatorCommand, HardwareEventKind, InboundDispatch, LabError, LabEvent, OutboundCommand,
};

fn led_on() -> ActuatorCommand {
    ActuatorCommand {
        actuator: "led1".into(),
        action: "on".into(),
        params: BTreeMap::new(),
    }
}

#[test]
fn test_sensor_data_without_session_is_dropped_but_logged() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    let mut rx = rig.broker.subscribe();

    let dispatch = rig
        .broker
        .handle_inbound("labs/lab-1/sensors", &sensor_payload("lab-1", None, 21.5))
        .unwrap();
    assert_eq!(
        dispatch,
        InboundDispatch::Sensor {
            lab_id: "lab-1".into(),
            session_id: None
        }
    );
    assert!(drain(&mut rx).iter().all(|e| !matches!(e, LabEvent::SensorData { .. })));

    let logged = rig.log.for_lab("lab-1");
    let sensor = logged
        .iter()
        .find(|e| e.event == HardwareEventKind::SensorRead)
        .expect("sensor read logged");
    assert!(sensor.dropped);
    assert!(sensor.session_id.is_none());
}

#[test]
fn test_sensor_data_reaches_bound_session_only() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    let handle = rig.broker.start_session("lab-1", "alice").unwrap();
    let mut rx = rig.broker.subscribe();

    rig.broker
        .handle_inbound("labs/lab-1/sensors", &sensor_payload("lab-1", None, 22.0))
        .unwrap();
    let stale = lab_broker::util::new_id();
    let dispatch = rig
        .broker
        .handle_inbound("labs/lab-1/sensors", &sensor_payload("lab-1", Some(stale), 23.0))
        .unwrap();
    assert!(matches!(dispatch, InboundDispatch::Sensor { session_id: None, .. }));

    let delivered: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            LabEvent::SensorData { session_id, sensors, .. } => Some((session_id, sensors)),
            _ => None,
        })
        .collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, handle.session_id);
    assert_eq!(delivered[0].1["temperature"], serde_json::json!(22.0));

    let for_session = rig.log.for_session(handle.session_id);
    assert!(for_session.iter().any(|e| e.event == HardwareEventKind::SensorRead && !e.dropped));
}

#[test]
fn test_actuator_command_follows_session() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    let handle = rig.broker.start_session("lab-1", "alice").unwrap();

    rig.broker.send_actuator(handle.session_id, "alice", led_on()).unwrap();
    let published = rig.agent.try_recv().expect("command published");
    assert_eq!(published.topic, "labs/lab-1/actuator");
    match published.decode().unwrap().message {
        OutboundCommand::Actuator(cmd) => assert_eq!(cmd, led_on()),
        other => panic!("unexpected command: {other:?}"),
    }

    assert_eq!(
        rig.broker.send_actuator(handle.session_id, "bob", led_on()).unwrap_err(),
        LabError::SessionNotFound(handle.session_id)
    );

    rig.broker.end_session(handle.session_id, "alice", None).unwrap();
    assert_eq!(
        rig.broker.send_actuator(handle.session_id, "alice", led_on()).unwrap_err(),
        LabError::SessionAlreadyTerminal(handle.session_id)
    );
    assert!(rig.broker.bridge().bound_session("lab-1").is_none());
    assert!(rig.agent.try_recv().is_none());
}

#[test]
fn test_malformed_payload_is_logged_as_error() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    let err = rig
        .broker
        .handle_inbound("labs/lab-1/sensors", b"{not json")
        .unwrap_err();
    assert_eq!(err.kind(), "bridge");

    let errors: Vec<_> = rig
        .log
        .for_lab("lab-1")
        .into_iter()
        .filter(|e| e.event == HardwareEventKind::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].dropped);
}

#[test]
fn test_heartbeat_from_unknown_lab_is_rejected() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    let err = rig
        .broker
        .handle_inbound("labs/ghost/heartbeat", &heartbeat_payload("ghost"))
        .unwrap_err();
    assert_eq!(err, LabError::LabNotFound("ghost".into()));
}

#[test]
fn test_heartbeat_counts_for_the_topic_lab_only() {
    let rig = rig(config(&[("lab-1", 1800), ("lab-2", 1800)]));
    rig.clock.advance(Duration::from_secs(61));
    let report = rig.broker.tick();
    assert_eq!(report.labs_went_offline, 2);

    // lab-1's agent reporting under lab-2's name must not revive lab-2.
    let err = rig
        .broker
        .handle_inbound("labs/lab-1/heartbeat", &heartbeat_payload("lab-2"))
        .unwrap_err();
    assert_eq!(err.kind(), "bridge");
    assert!(!rig.broker.registry().get("lab-1").unwrap().is_online);
    assert!(!rig.broker.registry().get("lab-2").unwrap().is_online);

    let rejected: Vec<_> = rig
        .log
        .for_lab("lab-1")
        .into_iter()
        .filter(|e| e.event == HardwareEventKind::Error)
        .collect();
    assert_eq!(rejected.len(), 1);

    heartbeat(&rig, "lab-1");
    assert!(rig.broker.registry().get("lab-1").unwrap().is_online);
    assert!(!rig.broker.registry().get("lab-2").unwrap().is_online);
}

#[test]
fn test_message_type_must_match_topic_channel() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    let handle = rig.broker.start_session("lab-1", "alice").unwrap();
    let mut rx = rig.broker.subscribe();

    let err = rig
        .broker
        .handle_inbound("labs/lab-1/heartbeat", &sensor_payload("lab-1", None, 20.0))
        .unwrap_err();
    assert_eq!(err.kind(), "bridge");
    let err = rig
        .broker
        .handle_inbound("labs/lab-1/sensors", &sensor_payload("lab-2", None, 20.0))
        .unwrap_err();
    assert_eq!(err.kind(), "bridge");
    assert!(drain(&mut rx).iter().all(|e| !matches!(e, LabEvent::SensorData { .. })));

    rig.broker
        .handle_inbound("labs/lab-1/sensors", &sensor_payload("lab-1", None, 20.0))
        .unwrap();
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        LabEvent::SensorData { session_id, .. } if *session_id == handle.session_id
    )));
}
