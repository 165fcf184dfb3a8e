//! Connection lifecycle scenarios against fake collaborators

mod common;

use common::{profile, EngineBehavior, FakeEngine, FakeInterfaces, Harness, Recorder};
use libchimney::supervisor::{
    MSG_CONNECTED, MSG_CONNECTING, MSG_DISCONNECTED, MSG_DISCONNECTING, MSG_ENGINE_EXITED,
    MSG_INTERFACE_FAILED, MSG_INTERFACE_READY,
};
use libchimney::{ConnectionProfile, ConnectionState, StatusSnapshot, SupervisorSettings};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ConnectionState::*;

fn pair(state: ConnectionState, message: &str) -> (ConnectionState, String) {
    (state, message.to_string())
}

#[test]
fn test_incomplete_profile_is_rejected_without_worker() {
    let h = Harness::new(FakeEngine::new(EngineBehavior::RunUntilStopped), FakeInterfaces::working());

    h.supervisor.connect(ConnectionProfile::new("", "x", "1.1.1.1"));

    let states = h.recorder.states();
    assert_eq!(states, vec![Idle, InvalidConfig, Stopped]);
    let snapshots = h.recorder.snapshots();
    assert!(snapshots[1].message.contains("tcpProxyUrl"));
    assert_eq!(snapshots[2].message, snapshots[1].message);

    assert!(!h.supervisor.is_worker_active());
    assert_eq!(h.supervisor.worker_stats().spawned, 0);
    assert_eq!(h.interfaces.acquired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_interface_failure_ends_in_stopped() {
    let h = Harness::new(FakeEngine::new(EngineBehavior::RunUntilStopped), FakeInterfaces::failing());

    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Stopped));
    h.wait_idle();

    assert_eq!(
        h.recorder.pairs(),
        vec![
            pair(Idle, "Initializing..."),
            pair(Connecting, MSG_CONNECTING),
            pair(Error, MSG_INTERFACE_FAILED),
            pair(Stopped, MSG_INTERFACE_FAILED),
        ]
    );
    assert_eq!(h.engine.starts.load(Ordering::SeqCst), 0);
}

#[test]
fn test_connect_then_disconnect() {
    let h = Harness::new(FakeEngine::new(EngineBehavior::RunUntilStopped), FakeInterfaces::working());

    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Connected));
    assert_eq!(h.supervisor.current_state(), Connected);

    h.supervisor.disconnect();
    assert!(h.recorder.wait_for_state(Stopped));
    h.wait_idle();

    assert_eq!(
        h.recorder.pairs(),
        vec![
            pair(Idle, "Initializing..."),
            pair(Connecting, MSG_CONNECTING),
            pair(Connecting, MSG_INTERFACE_READY),
            pair(Connected, MSG_CONNECTED),
            pair(Disconnecting, MSG_DISCONNECTING),
            pair(Stopped, MSG_DISCONNECTED),
        ]
    );
    let stats = h.supervisor.worker_stats();
    assert_eq!((stats.spawned, stats.completed), (1, 1));
}

#[test]
fn test_rapid_connects_spawn_one_worker() {
    let h = Harness::new(FakeEngine::new(EngineBehavior::RunUntilStopped), FakeInterfaces::working());

    h.supervisor.connect(profile());
    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Connected));
    h.supervisor.connect(profile());

    let connecting = h
        .recorder
        .pairs()
        .into_iter()
        .filter(|p| *p == pair(Connecting, MSG_CONNECTING))
        .count();
    assert_eq!(connecting, 1);
    assert_eq!(h.supervisor.worker_stats().spawned, 1);
    assert_eq!(h.engine.starts.load(Ordering::SeqCst), 1);

    h.supervisor.disconnect();
    h.wait_idle();
}

#[test]
fn test_disconnect_from_idle_notifies_every_observer_once() {
    let h = Harness::new(FakeEngine::new(EngineBehavior::RunUntilStopped), FakeInterfaces::working());
    let second = Recorder::new();
    h.hub.register(second.clone());

    h.supervisor.disconnect();
    h.supervisor.disconnect();

    for recorder in [&h.recorder, &second] {
        assert_eq!(
            recorder.pairs(),
            vec![pair(Idle, "Initializing..."), pair(Stopped, MSG_DISCONNECTED)]
        );
    }
    assert_eq!(h.engine.stop_requests.load(Ordering::SeqCst), 0);
}

#[test]
fn test_engine_exiting_on_its_own() {
    let h = Harness::new(
        FakeEngine::new(EngineBehavior::ExitAfter(Duration::from_millis(50))),
        FakeInterfaces::working(),
    );

    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Stopped));
    h.wait_idle();

    let pairs = h.recorder.pairs();
    assert_eq!(
        pairs[pairs.len() - 3..],
        [
            pair(Connected, MSG_CONNECTED),
            pair(Disconnecting, MSG_ENGINE_EXITED),
            pair(Stopped, MSG_ENGINE_EXITED),
        ]
    );
}

#[test]
fn test_engine_returning_without_ready_holds_session() {
    let h = Harness::new(FakeEngine::new(EngineBehavior::ReturnImmediately), FakeInterfaces::working());

    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Connected));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(h.supervisor.current_state(), Connected);
    assert!(h.supervisor.is_worker_active());

    h.supervisor.disconnect();
    assert!(h.recorder.wait_for_state(Stopped));
    h.wait_idle();
    assert_eq!(h.supervisor.current_snapshot().message, MSG_DISCONNECTED);
}

#[test]
fn test_engine_failure_is_published() {
    let h = Harness::new(
        FakeEngine::new(EngineBehavior::Fail("proxy refused".to_string())),
        FakeInterfaces::working(),
    );

    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Stopped));
    h.wait_idle();

    let pairs = h.recorder.pairs();
    let message = "Tunnel engine failure: proxy refused";
    assert_eq!(pairs[pairs.len() - 2..], [pair(Error, message), pair(Stopped, message)]);
}

#[test]
fn test_engine_panic_is_contained() {
    let h = Harness::new(FakeEngine::new(EngineBehavior::Panic), FakeInterfaces::working());

    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Stopped));
    h.wait_idle();

    let snapshot = h.supervisor.current_snapshot();
    assert_eq!(snapshot.message, "Unexpected failure: engine exploded");
    assert!(h.recorder.states().contains(&Error));
    assert_eq!(h.supervisor.worker_stats().live(), 0);

    // A later attempt still gets a fresh worker
    h.supervisor.connect(profile());
    assert_eq!(h.supervisor.worker_stats().spawned, 2);
    h.wait_idle();
}

#[test]
fn test_reconnect_after_stop() {
    let h = Harness::new(FakeEngine::new(EngineBehavior::RunUntilStopped), FakeInterfaces::working());

    for _ in 0..3 {
        let before = h.hub.current_snapshot().sequence;
        h.supervisor.connect(profile());
        assert!(h.recorder.wait_for(|s| s.state == Connected && s.sequence > before));
        h.supervisor.disconnect();
        h.wait_idle();
        assert_eq!(h.supervisor.current_state(), Stopped);
    }

    let stats = h.supervisor.worker_stats();
    assert_eq!((stats.spawned, stats.completed), (3, 3));
    assert_eq!(h.engine.starts.load(Ordering::SeqCst), 3);
}

#[test]
fn test_stop_request_is_repeated_until_honored() {
    let settings = SupervisorSettings {
        stop_timeout: Duration::from_secs(5),
        stop_poll_interval: Duration::from_millis(20),
    };
    let h = Harness::with_settings(
        FakeEngine::new(EngineBehavior::IgnoreStops(2)),
        FakeInterfaces::working(),
        settings,
    );

    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Connected));
    h.supervisor.disconnect();
    assert!(h.recorder.wait_for_state(Stopped));
    h.wait_idle();

    assert!(h.engine.stop_requests.load(Ordering::SeqCst) >= 3);
    assert_eq!(h.supervisor.current_snapshot().message, MSG_DISCONNECTED);
}

#[test]
fn test_unresponsive_engine_is_abandoned() {
    let settings = SupervisorSettings {
        stop_timeout: Duration::from_millis(300),
        stop_poll_interval: Duration::from_millis(50),
    };
    let h = Harness::with_settings(
        FakeEngine::new(EngineBehavior::IgnoreStops(usize::MAX)),
        FakeInterfaces::working(),
        settings,
    );

    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Connected));
    h.supervisor.disconnect();

    assert!(h.recorder.wait_for(|s| s.state == Stopped));
    let abandoned = h.supervisor.current_snapshot();
    assert_eq!(
        abandoned.message,
        "Tunnel engine did not stop within 300ms; connection abandoned"
    );

    // The slot stays reserved while the thread is alive
    assert!(h.supervisor.is_worker_active());
    h.supervisor.connect(profile());
    assert_eq!(h.supervisor.worker_stats().spawned, 1);
    assert_eq!(h.supervisor.current_snapshot(), abandoned);

    // Once it finally exits nothing more is published
    h.engine.release();
    h.wait_idle();
    assert_eq!(h.supervisor.current_snapshot(), abandoned);

    h.supervisor.connect(profile());
    assert_eq!(h.supervisor.worker_stats().spawned, 2);
    assert!(h.recorder.wait_for(|s| s.state == Connected && s.sequence > abandoned.sequence));
    h.engine.release();
    h.wait_idle();
}

#[test]
fn test_never_more_than_one_worker() {
    let h = Arc::new(Harness::new(
        FakeEngine::new(EngineBehavior::RunUntilStopped),
        FakeInterfaces::working(),
    ));

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let h = h.clone();
            thread::spawn(move || {
                for n in 0..40 {
                    if (n + i) % 3 == 0 {
                        h.supervisor.disconnect();
                    } else {
                        h.supervisor.connect(profile());
                    }
                    assert!(h.supervisor.worker_stats().live() <= 1);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(h.supervisor.shutdown(Duration::from_secs(5)));
    let stats = h.supervisor.worker_stats();
    assert_eq!(stats.spawned, stats.completed);
    assert_eq!(h.supervisor.current_state(), Stopped);
}

#[test]
fn test_observers_see_contiguous_sequences() {
    let h = Harness::new(FakeEngine::new(EngineBehavior::RunUntilStopped), FakeInterfaces::working());

    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Connecting));
    let late = Recorder::new();
    h.hub.register(late.clone());

    assert!(h.recorder.wait_for_state(Connected));
    h.supervisor.disconnect();
    assert!(late.wait_for_state(Stopped));
    h.wait_idle();

    for snapshots in [h.recorder.snapshots(), late.snapshots()] {
        let sequences: Vec<u64> = snapshots.iter().map(|s: &StatusSnapshot| s.sequence).collect();
        for window in sequences.windows(2) {
            assert_eq!(window[1], window[0] + 1, "gap in {:?}", sequences);
        }
    }
    assert_eq!(late.snapshots().last(), h.recorder.snapshots().last());
}

#[test]
fn test_shutdown_joins_worker() {
    let h = Harness::new(FakeEngine::new(EngineBehavior::RunUntilStopped), FakeInterfaces::working());

    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Connected));

    assert!(h.supervisor.shutdown(Duration::from_secs(2)));
    assert!(!h.supervisor.is_worker_active());
    assert_eq!(h.supervisor.current_snapshot().message, MSG_DISCONNECTED);
}

#[test]
fn test_shutdown_times_out_on_stuck_engine() {
    let settings = SupervisorSettings {
        stop_timeout: Duration::from_secs(30),
        stop_poll_interval: Duration::from_millis(50),
    };
    let h = Harness::with_settings(
        FakeEngine::new(EngineBehavior::IgnoreStops(usize::MAX)),
        FakeInterfaces::working(),
        settings,
    );

    h.supervisor.connect(profile());
    assert!(h.recorder.wait_for_state(Connected));
    assert!(!h.supervisor.shutdown(Duration::from_millis(200)));

    h.engine.release();
    h.wait_idle();
    assert_eq!(h.supervisor.current_snapshot().message, MSG_DISCONNECTED);
}
