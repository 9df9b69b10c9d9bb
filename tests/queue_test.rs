//! Integration tests for bid-weighted queues: ordering, dense positions,
//! admission limits, TTL expiry and restore from the store.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{drain, heartbeat_payload, rig, steady, START_MS};
use lab_broker::builders::BrokerBuilder;
use lab_broker::core::{
    CodeCompilation, JoinOutcome, Lab, LabBooking, LabError, LabEvent, LabQueueEntry, LabSession,
    LabStatus, LabStore, SessionStatus,
};
use lab_broker::infra::{ChannelTransport, InMemoryLabStore};
use lab_broker::util::{CompilationId, ManualClock, SessionId};

fn assert_dense(rig: &common::Rig, lab_id: &str) {
    let positions: Vec<u32> = rig
        .broker
        .queue()
        .entries(lab_id)
        .iter()
        .map(|e| e.position)
        .collect();
    let expected: Vec<u32> = (1..=u32::try_from(positions.len()).unwrap()).collect();
    assert_eq!(positions, expected);
}

fn queued(outcome: JoinOutcome) -> u32 {
    match outcome {
        JoinOutcome::Queued(ticket) => ticket.position,
        JoinOutcome::Started(handle) => panic!("unexpected start for {}", handle.user_id),
    }
}

#[test]
fn test_bid_order_then_fifo_promotion() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    let holder = rig.broker.start_session("lab-1", "holder").unwrap();

    for (user, bid) in [("u1", 10), ("u2", 10), ("u3", 5)] {
        rig.broker.join_queue("lab-1", user, bid).unwrap();
        rig.clock.advance(Duration::from_secs(1));
    }
    assert_dense(&rig, "lab-1");

    let mut served = Vec::new();
    let mut current = holder.session_id;
    let mut owner = "holder".to_string();
    for _ in 0..3 {
        rig.broker.end_session(current, &owner, None).unwrap();
        let next = rig.broker.sessions().active_for_lab("lab-1").unwrap();
        served.push(next.user_id.clone());
        current = next.id;
        owner = next.user_id;
        assert_dense(&rig, "lab-1");
    }
    assert_eq!(served, vec!["u1", "u2", "u3"]);
}

#[test]
fn test_higher_bid_overtakes_earlier_joiners() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    rig.broker.start_session("lab-1", "holder").unwrap();

    assert_eq!(queued(rig.broker.join_queue("lab-1", "low", 0).unwrap()), 1);
    rig.clock.advance(Duration::from_secs(5));
    assert_eq!(queued(rig.broker.join_queue("lab-1", "high", 50).unwrap()), 1);

    assert_eq!(rig.broker.queue_position("lab-1", "low").unwrap().position, 2);
    assert_dense(&rig, "lab-1");
    assert_eq!(rig.broker.registry().get("lab-1").unwrap().queue_count, 2);
}

#[test]
fn test_leave_compacts_positions() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    let mut rx = rig.broker.subscribe();
    rig.broker.start_session("lab-1", "holder").unwrap();
    for user in ["a", "b", "c", "d"] {
        rig.broker.join_queue("lab-1", user, 0).unwrap();
    }
    drain(&mut rx);

    rig.broker.leave_queue("lab-1", "b").unwrap();
    assert_dense(&rig, "lab-1");
    let c = rig.broker.queue_position("lab-1", "c").unwrap();
    assert_eq!(c.position, 2);
    assert_eq!(c.estimated_wait_secs, 2 * 1800);

    let moved: Vec<(String, u32)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            LabEvent::QueueUpdated { user_id, position, .. } => Some((user_id, position)),
            _ => None,
        })
        .collect();
    assert_eq!(moved, vec![("c".to_string(), 2), ("d".to_string(), 3)]);

    assert_eq!(
        rig.broker.leave_queue("lab-1", "b").unwrap_err(),
        LabError::NotQueued("lab-1".into())
    );
}

#[test]
fn test_admission_rejects() {
    let mut cfg = steady(&[("lab-1", 1800)]);
    cfg.max_queue_depth = 2;
    cfg.max_bid = 100;
    let rig = rig(cfg);
    rig.broker.start_session("lab-1", "holder").unwrap();

    assert_eq!(rig.broker.join_queue("lab-1", "a", -1).unwrap_err(), LabError::InvalidBid(-1));
    assert_eq!(rig.broker.join_queue("lab-1", "a", 101).unwrap_err(), LabError::InvalidBid(101));
    assert_eq!(
        rig.broker.join_queue("lab-x", "a", 0).unwrap_err(),
        LabError::LabNotFound("lab-x".into())
    );

    rig.broker.join_queue("lab-1", "a", 100).unwrap();
    assert_eq!(
        rig.broker.join_queue("lab-1", "a", 0).unwrap_err(),
        LabError::AlreadyQueued("lab-1".into())
    );
    rig.broker.join_queue("lab-1", "b", 0).unwrap();
    assert_eq!(
        rig.broker.join_queue("lab-1", "c", 0).unwrap_err(),
        LabError::QueueFull("lab-1".into())
    );
    assert_eq!(
        rig.broker.join_queue("lab-1", "holder", 0).unwrap_err(),
        LabError::ResourceBusy("lab-1".into())
    );
}

#[test]
fn test_lapsed_entries_expire_on_sweep() {
    let rig = rig(steady(&[("lab-1", 3600)]));
    let mut rx = rig.broker.subscribe();
    rig.broker.start_session("lab-1", "holder").unwrap();
    rig.broker.join_queue("lab-1", "early", 0).unwrap();
    rig.clock.advance(Duration::from_secs(600));
    rig.broker.join_queue("lab-1", "late", 0).unwrap();

    rig.clock.advance(Duration::from_secs(301));
    assert_eq!(
        rig.broker.queue_position("lab-1", "early").unwrap_err(),
        LabError::QueueEntryExpired("lab-1".into())
    );

    let report = rig.broker.tick();
    assert_eq!(report.queue_expired, 1);
    assert_eq!(
        rig.broker.queue_position("lab-1", "early").unwrap_err(),
        LabError::NotQueued("lab-1".into())
    );
    assert_eq!(rig.broker.queue_position("lab-1", "late").unwrap().position, 1);
    assert_dense(&rig, "lab-1");
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        LabEvent::QueueExpired { user_id, .. } if user_id == "early"
    )));
}

#[test]
fn test_lapsed_user_may_rejoin_before_sweep() {
    let rig = rig(steady(&[("lab-1", 3600)]));
    rig.broker.start_session("lab-1", "holder").unwrap();
    rig.broker.join_queue("lab-1", "a", 0).unwrap();
    rig.clock.advance(Duration::from_secs(901));

    assert_eq!(queued(rig.broker.join_queue("lab-1", "a", 0).unwrap()), 1);
    assert_eq!(rig.broker.queue().len("lab-1"), 1);
}

#[test]
fn test_queue_restored_from_store() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    rig.broker.start_session("lab-1", "holder").unwrap();
    rig.broker.join_queue("lab-1", "a", 0).unwrap();
    rig.broker.join_queue("lab-1", "b", 7).unwrap();
    assert_eq!(rig.store.load_queue("lab-1").unwrap().len(), 2);

    let (transport, _agent) = ChannelTransport::bounded(16);
    let restarted = BrokerBuilder::new(steady(&[("lab-1", 1800)]))
        .transport(transport)
        .store(rig.store.clone())
        .clock(Arc::new(ManualClock::new(START_MS + 10_000)))
        .build()
        .unwrap();

    let users: Vec<String> = restarted
        .queue()
        .entries("lab-1")
        .into_iter()
        .map(|e| e.user_id)
        .collect();
    assert_eq!(users, vec!["b", "a"]);
    assert_eq!(restarted.registry().get("lab-1").unwrap().queue_count, 2);
}

#[test]
fn test_operator_status_survives_restart() {
    let rig = rig(steady(&[("lab-1", 1800), ("lab-2", 1800)]));
    rig.broker.set_lab_status("lab-1", LabStatus::Maintenance).unwrap();

    let (transport, _agent) = ChannelTransport::bounded(16);
    let restarted = BrokerBuilder::new(steady(&[("lab-1", 1800), ("lab-2", 1800)]))
        .transport(transport)
        .store(rig.store.clone())
        .clock(Arc::new(ManualClock::new(START_MS + 10_000)))
        .build()
        .unwrap();

    assert_eq!(restarted.registry().get("lab-1").unwrap().status, LabStatus::Maintenance);
    assert_eq!(restarted.registry().get("lab-2").unwrap().status, LabStatus::Available);
    assert_eq!(
        restarted.start_session("lab-1", "alice").unwrap_err().kind(),
        "resource_busy"
    );
}

/// In-memory store whose session writes can be made to fail.
#[derive(Default)]
struct SessionWriteFailure {
    inner: InMemoryLabStore,
    failing: AtomicBool,
}

impl LabStore for SessionWriteFailure {
    fn open(&self) -> Result<(), LabError> {
        self.inner.open()
    }
    fn close(&self) {
        self.inner.close();
    }
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
    fn save_lab(&self, lab: &Lab) -> Result<(), LabError> {
        self.inner.save_lab(lab)
    }
    fn load_labs(&self) -> Result<Vec<Lab>, LabError> {
        self.inner.load_labs()
    }
    fn save_session(&self, session: &LabSession) -> Result<(), LabError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LabError::Storage("session table unavailable".into()));
        }
        self.inner.save_session(session)
    }
    fn get_session(&self, id: SessionId) -> Result<Option<LabSession>, LabError> {
        self.inner.get_session(id)
    }
    fn recent_session_durations(&self, lab_id: &str, limit: usize) -> Result<Vec<u64>, LabError> {
        self.inner.recent_session_durations(lab_id, limit)
    }
    fn save_queue(&self, lab_id: &str, entries: &[LabQueueEntry]) -> Result<(), LabError> {
        self.inner.save_queue(lab_id, entries)
    }
    fn load_queue(&self, lab_id: &str) -> Result<Vec<LabQueueEntry>, LabError> {
        self.inner.load_queue(lab_id)
    }
    fn save_booking(&self, booking: &LabBooking) -> Result<(), LabError> {
        self.inner.save_booking(booking)
    }
    fn save_compilation(&self, job: &CodeCompilation) -> Result<(), LabError> {
        self.inner.save_compilation(job)
    }
    fn get_compilation(&self, id: CompilationId) -> Result<Option<CodeCompilation>, LabError> {
        self.inner.get_compilation(id)
    }
}

#[test]
fn test_failed_hand_over_keeps_entry_queued() {
    let store = Arc::new(SessionWriteFailure::default());
    let (transport, _agent) = ChannelTransport::bounded(16);
    let broker = BrokerBuilder::new(steady(&[("lab-1", 1800)]))
        .transport(transport)
        .store(store.clone())
        .clock(Arc::new(ManualClock::new(START_MS)))
        .build()
        .unwrap();
    broker
        .handle_inbound("labs/lab-1/heartbeat", &heartbeat_payload("lab-1"))
        .unwrap();

    store.failing.store(true, Ordering::SeqCst);
    match broker.join_queue("lab-1", "alice", 0).unwrap() {
        JoinOutcome::Queued(ticket) => assert_eq!(ticket.position, 1),
        JoinOutcome::Started(handle) => panic!("started {} despite failed write", handle.session_id),
    }
    assert_eq!(broker.queue().len("lab-1"), 1);
    assert_eq!(store.load_queue("lab-1").unwrap().len(), 1);
    assert_eq!(broker.registry().get("lab-1").unwrap().status, LabStatus::Available);

    store.failing.store(false, Ordering::SeqCst);
    assert_eq!(broker.tick().promoted, 1);
    let session = broker.sessions().active_for_lab("lab-1").expect("alice promoted");
    assert_eq!(session.user_id, "alice");
    assert_eq!(session.status, SessionStatus::Active);
    assert!(broker.queue().is_empty("lab-1"));
}
