//! Integration tests for session exclusivity, expiry, warnings and the
//! offline force-end path.

mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{config, drain, heartbeat, rig, single_lab, steady};
use lab_broker::core::{
    EndReason, JoinOutcome, LabError, LabEvent, LabStatus, SessionFeedback, SessionStatus,
};
use lab_broker::util::Clock;

// ============================================================================
// EXCLUSIVITY
// ============================================================================

#[test]
fn test_second_start_is_resource_busy() {
    let rig = single_lab();
    let handle = rig.broker.start_session("lab-1", "alice").unwrap();
    assert_eq!(handle.status, SessionStatus::Active);

    let lab = rig.broker.registry().get("lab-1").unwrap();
    assert_eq!(lab.status, LabStatus::Busy);
    assert_eq!(lab.current_user_id.as_deref(), Some("alice"));

    let err = rig.broker.start_session("lab-1", "bob").unwrap_err();
    assert_eq!(err, LabError::ResourceBusy("lab-1".into()));
}

#[test]
fn test_concurrent_starts_yield_one_session() {
    let rig = single_lab();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let broker = Arc::clone(&rig.broker);
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || {
                    barrier.wait();
                    broker.start_session("lab-1", &format!("user-{i}"))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let started = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(started, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, LabError::ResourceBusy(_))));
    assert_eq!(rig.broker.sessions().live_count(), 1);
}

#[test]
fn test_start_on_silent_lab_is_hardware_offline() {
    let mut cfg = config(&[("lab-1", 1800), ("lab-2", 1800)]);
    cfg.heartbeat_offline_secs = 30;
    let rig = rig(cfg);
    rig.clock.advance(Duration::from_secs(31));
    heartbeat(&rig, "lab-2");
    rig.broker.tick();

    let err = rig.broker.start_session("lab-1", "alice").unwrap_err();
    assert_eq!(err.kind(), "hardware_offline");
    assert!(rig.broker.start_session("lab-2", "alice").is_ok());
}

// ============================================================================
// HAND-OFF
// ============================================================================

#[test]
fn test_end_promotes_waiter_and_compacts_queue() {
    let rig = single_lab();
    let mut rx = rig.broker.subscribe();
    let a = rig.broker.start_session("lab-1", "a").unwrap();

    assert!(matches!(
        rig.broker.start_session("lab-1", "b"),
        Err(LabError::ResourceBusy(_))
    ));
    let JoinOutcome::Queued(ticket) = rig.broker.join_queue("lab-1", "b", 0).unwrap() else {
        panic!("busy lab must queue");
    };
    assert_eq!(ticket.position, 1);
    rig.broker.join_queue("lab-1", "c", 0).unwrap();
    assert_eq!(rig.broker.queue_position("lab-1", "c").unwrap().position, 2);

    rig.clock.advance(Duration::from_secs(90));
    let summary = rig.broker.end_session(a.session_id, "a", None).unwrap();
    assert_eq!(summary.status, SessionStatus::Completed);
    assert_eq!(summary.duration_seconds, 90);

    let live = rig.broker.sessions().active_for_lab("lab-1").unwrap();
    assert_eq!(live.user_id, "b");
    assert_eq!(live.status, SessionStatus::Active);
    assert!(matches!(
        rig.broker.queue_position("lab-1", "b"),
        Err(LabError::NotQueued(_))
    ));
    assert_eq!(rig.broker.queue_position("lab-1", "c").unwrap().position, 1);
    assert_eq!(rig.broker.registry().get("lab-1").unwrap().current_user_id.as_deref(), Some("b"));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        LabEvent::SessionStarted { user_id, promoted: true, .. } if user_id == "b"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        LabEvent::Notification { user_id, .. } if user_id == "b"
    )));
}

#[test]
fn test_join_on_idle_lab_starts_immediately() {
    let rig = single_lab();
    match rig.broker.join_queue("lab-1", "alice", 3).unwrap() {
        JoinOutcome::Started(handle) => {
            assert_eq!(handle.user_id, "alice");
            assert_eq!(handle.channel.sensors_topic, "labs/lab-1/sensors");
        }
        JoinOutcome::Queued(ticket) => panic!("idle lab queued at {}", ticket.position),
    }
    assert_eq!(rig.broker.queue().len("lab-1"), 0);
}

#[test]
fn test_end_is_first_writer_wins() {
    let rig = single_lab();
    let handle = rig.broker.start_session("lab-1", "alice").unwrap();

    let err = rig.broker.end_session(handle.session_id, "mallory", None).unwrap_err();
    assert_eq!(err, LabError::SessionNotFound(handle.session_id));

    let feedback = SessionFeedback {
        rating: Some(4),
        comment: Some("worked".into()),
    };
    rig.broker.end_session(handle.session_id, "alice", Some(feedback)).unwrap();
    let err = rig.broker.end_session(handle.session_id, "alice", None).unwrap_err();
    assert_eq!(err, LabError::SessionAlreadyTerminal(handle.session_id));

    let stored = rig.broker.sessions().get(handle.session_id).unwrap();
    assert_eq!(stored.rating, Some(4));
    let persisted = rig.store.sessions_for_lab("lab-1");
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].status, SessionStatus::Completed);
    assert_eq!(stored.feedback.as_deref(), Some("worked"));
    assert_eq!(rig.broker.registry().get("lab-1").unwrap().status, LabStatus::Available);
}

#[test]
fn test_out_of_range_rating_is_rejected() {
    let rig = single_lab();
    let handle = rig.broker.start_session("lab-1", "alice").unwrap();

    for rating in [0, 6, 200] {
        let feedback = SessionFeedback {
            rating: Some(rating),
            comment: None,
        };
        let err = rig
            .broker
            .end_session(handle.session_id, "alice", Some(feedback))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_feedback");
    }
    let live = rig.broker.sessions().get(handle.session_id).unwrap();
    assert_eq!(live.status, SessionStatus::Active);
    assert_eq!(rig.broker.registry().get("lab-1").unwrap().status, LabStatus::Busy);

    let summary = rig
        .broker
        .end_session(
            handle.session_id,
            "alice",
            Some(SessionFeedback {
                rating: Some(1),
                comment: None,
            }),
        )
        .unwrap();
    assert_eq!(summary.status, SessionStatus::Completed);
    assert_eq!(rig.broker.sessions().get(handle.session_id).unwrap().rating, Some(1));
}

// ============================================================================
// DEADLINES
// ============================================================================

#[test]
fn test_session_expires_exactly_once_and_promotes() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    let mut rx = rig.broker.subscribe();
    let handle = rig.broker.start_session("lab-1", "alice").unwrap();
    rig.broker.join_queue("lab-1", "bob", 0).unwrap();

    rig.clock.advance(Duration::from_secs(1799));
    assert_eq!(rig.broker.remaining(handle.session_id).unwrap(), 1);
    assert_eq!(rig.broker.tick().sessions_expired, 0);

    rig.clock.advance(Duration::from_secs(1));
    assert_eq!(rig.broker.remaining(handle.session_id).unwrap(), 0);
    let report = rig.broker.tick();
    assert_eq!(report.sessions_expired, 1);
    assert_eq!(rig.broker.tick().sessions_expired, 0);

    let ended = rig.broker.sessions().get(handle.session_id).unwrap();
    assert_eq!(ended.status, SessionStatus::Expired);
    assert_eq!(ended.duration_seconds, 1800);
    assert_eq!(ended.xp_earned, 70);

    let expired_events = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, LabEvent::SessionEnded { reason: EndReason::Expired, .. }))
        .count();
    assert_eq!(expired_events, 1);
    assert_eq!(rig.broker.sessions().active_for_lab("lab-1").unwrap().user_id, "bob");
}

#[test]
fn test_warnings_fire_once_per_threshold() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    let mut rx = rig.broker.subscribe();
    let handle = rig.broker.start_session("lab-1", "alice").unwrap();

    rig.clock.advance(Duration::from_secs(1500));
    assert_eq!(rig.broker.tick().warnings, 1);
    assert_eq!(rig.broker.tick().warnings, 0);

    rig.clock.advance(Duration::from_secs(240));
    assert_eq!(rig.broker.tick().warnings, 1);
    assert_eq!(rig.broker.tick().warnings, 0);

    let thresholds: Vec<u64> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            LabEvent::SessionWarning { session_id, threshold_secs, .. } if session_id == handle.session_id => {
                Some(threshold_secs)
            }
            _ => None,
        })
        .collect();
    assert_eq!(thresholds, vec![300, 60]);
}

#[test]
fn test_crossing_several_thresholds_announces_tightest() {
    let rig = rig(steady(&[("lab-1", 1800)]));
    let mut rx = rig.broker.subscribe();
    rig.broker.start_session("lab-1", "alice").unwrap();

    rig.clock.advance(Duration::from_secs(1770));
    assert_eq!(rig.broker.tick().warnings, 1);
    rig.clock.advance(Duration::from_secs(5));
    assert_eq!(rig.broker.tick().warnings, 0);

    let warnings: Vec<(u64, u64)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            LabEvent::SessionWarning { remaining_secs, threshold_secs, .. } => {
                Some((remaining_secs, threshold_secs))
            }
            _ => None,
        })
        .collect();
    assert_eq!(warnings, vec![(30, 60)]);
}

#[test]
fn test_unconfirmed_promotion_is_cancelled() {
    let mut cfg = steady(&[("lab-1", 600)]);
    cfg.promotion_confirm_grace_secs = Some(30);
    let rig = rig(cfg);

    let holder = rig.broker.start_session("lab-1", "alice").unwrap();
    assert_eq!(holder.status, SessionStatus::Active);
    rig.broker.join_queue("lab-1", "bob", 0).unwrap();
    rig.broker.join_queue("lab-1", "carol", 0).unwrap();
    rig.broker.end_session(holder.session_id, "alice", None).unwrap();

    let bob = rig.broker.sessions().active_for_lab("lab-1").unwrap();
    assert_eq!(bob.user_id, "bob");
    assert_eq!(bob.status, SessionStatus::Requested);
    assert_eq!(
        rig.broker.sessions().require_active(bob.id).unwrap_err(),
        LabError::SessionNotActive(bob.id)
    );

    rig.clock.advance(Duration::from_secs(30));
    let report = rig.broker.tick();
    assert_eq!(report.promotions_cancelled, 1);
    let cancelled = rig.broker.sessions().get(bob.id).unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert_eq!(cancelled.xp_earned, 0);

    let carol = rig.broker.sessions().active_for_lab("lab-1").unwrap();
    assert_eq!(carol.user_id, "carol");
    rig.clock.advance(Duration::from_secs(10));
    let confirmed = rig.broker.confirm_session(carol.id, "carol").unwrap();
    assert_eq!(confirmed.status, SessionStatus::Active);
    assert_eq!(confirmed.expires_at_ms, rig.clock.now_ms() + 600_000);
}

// ============================================================================
// OFFLINE
// ============================================================================

#[test]
fn test_offline_lab_force_ends_with_served_xp() {
    let rig = single_lab();
    let mut rx = rig.broker.subscribe();
    let handle = rig.broker.start_session("lab-1", "alice").unwrap();

    rig.clock.advance(Duration::from_secs(600));
    let report = rig.broker.tick();
    assert_eq!(report.labs_went_offline, 1);
    assert_eq!(report.sessions_force_ended, 1);

    let lab = rig.broker.registry().get("lab-1").unwrap();
    assert!(!lab.is_online);
    assert_eq!(lab.status, LabStatus::Available);
    assert!(lab.current_user_id.is_none());

    let ended = rig.broker.sessions().get(handle.session_id).unwrap();
    assert_eq!(ended.end_reason, Some(EndReason::HardwareOffline));
    assert_eq!(ended.duration_seconds, 600);
    assert_eq!(ended.xp_earned, 20);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        LabEvent::RewardEarned(reward) if reward.xp == 20 && reward.reason == EndReason::HardwareOffline
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        LabEvent::LabStatusChanged { is_online: false, .. }
    )));
}

#[test]
fn test_repeated_offline_sweeps_need_operator() {
    let rig = single_lab();
    rig.clock.advance(Duration::from_secs(120));
    let first = rig.broker.tick();
    assert_eq!(first.labs_went_offline, 1);
    assert_eq!(first.labs_marked_offline, 0);
    rig.broker.tick();
    assert_eq!(rig.broker.tick().labs_marked_offline, 1);
    assert_eq!(rig.broker.registry().get("lab-1").unwrap().status, LabStatus::Offline);

    heartbeat(&rig, "lab-1");
    let lab = rig.broker.registry().get("lab-1").unwrap();
    assert!(lab.is_online);
    assert_eq!(lab.status, LabStatus::Offline);
    assert_eq!(
        rig.broker.start_session("lab-1", "alice").unwrap_err(),
        LabError::HardwareOffline("lab-1".into())
    );

    rig.broker.set_lab_status("lab-1", LabStatus::Available).unwrap();
    assert!(rig.broker.start_session("lab-1", "alice").is_ok());
}

#[test]
fn test_returning_agent_promotes_waiter() {
    let rig = single_lab();
    rig.clock.advance(Duration::from_secs(120));
    rig.broker.tick();

    let JoinOutcome::Queued(ticket) = rig.broker.join_queue("lab-1", "alice", 0).unwrap() else {
        panic!("silent lab must not start a session");
    };
    assert_eq!(ticket.position, 1);

    heartbeat(&rig, "lab-1");
    let live = rig.broker.sessions().active_for_lab("lab-1").unwrap();
    assert_eq!(live.user_id, "alice");
}
