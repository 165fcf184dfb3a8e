//! Shared fakes for the integration tests

#![allow(dead_code)]

use libchimney::error::{ChimneyError, ChimneyResult};
use libchimney::{
    ConnectionProfile, ConnectionState, ConnectionSupervisor, EngineSession, InterfaceProvider,
    StatusHub, StatusObserver, StatusSnapshot, SupervisorSettings, TunnelEngine, TunnelInterface,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn profile() -> ConnectionProfile {
    ConnectionProfile::new("socks5://proxy.example.com:1080", "udp://proxy.example.com:1081", "1.1.1.1")
}

/// How the fake engine behaves once started
#[derive(Debug, Clone)]
pub enum EngineBehavior {
    /// Mark ready, then block until a stop request
    RunUntilStopped,
    /// Mark ready, then block until more than this many stop requests arrive
    IgnoreStops(usize),
    /// Mark ready, then return on its own
    ExitAfter(Duration),
    /// Return `Ok` at once without marking ready
    ReturnImmediately,
    /// Mark ready, then fail with this message
    Fail(String),
    Panic,
}

#[derive(Default)]
struct EngineState {
    stops: usize,
    released: bool,
}

pub struct FakeEngine {
    behavior: EngineBehavior,
    state: Mutex<EngineState>,
    cond: Condvar,
    pub starts: AtomicUsize,
    pub stop_requests: AtomicUsize,
}

impl FakeEngine {
    pub fn new(behavior: EngineBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            state: Mutex::new(EngineState::default()),
            cond: Condvar::new(),
            starts: AtomicUsize::new(0),
            stop_requests: AtomicUsize::new(0),
        })
    }

    /// Let a blocked `start` return regardless of stop requests
    pub fn release(&self) {
        self.state.lock().unwrap().released = true;
        self.cond.notify_all();
    }
}

impl TunnelEngine for FakeEngine {
    fn start(&self, session: &EngineSession<'_>) -> ChimneyResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = EngineState::default();

        let ignored = match &self.behavior {
            EngineBehavior::ReturnImmediately => return Ok(()),
            EngineBehavior::Panic => panic!("engine exploded"),
            EngineBehavior::Fail(message) => {
                session.mark_ready();
                return Err(ChimneyError::EngineFailure(message.clone()));
            }
            EngineBehavior::ExitAfter(delay) => {
                session.mark_ready();
                thread::sleep(*delay);
                return Ok(());
            }
            EngineBehavior::RunUntilStopped => 0,
            EngineBehavior::IgnoreStops(n) => *n,
        };

        session.mark_ready();
        let mut state = self.state.lock().unwrap();
        while !state.released && state.stops <= ignored {
            state = self.cond.wait_timeout(state, Duration::from_millis(50)).unwrap().0;
        }
        Ok(())
    }

    fn request_stop(&self) {
        self.stop_requests.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().stops += 1;
        self.cond.notify_all();
    }
}

/// Interface provider handing out descriptor-less interfaces
pub struct FakeInterfaces {
    fail: bool,
    pub acquired: AtomicUsize,
}

impl FakeInterfaces {
    pub fn working() -> Arc<Self> {
        Arc::new(Self { fail: false, acquired: AtomicUsize::new(0) })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { fail: true, acquired: AtomicUsize::new(0) })
    }
}

impl InterfaceProvider for FakeInterfaces {
    fn acquire(&self, _profile: &ConnectionProfile) -> ChimneyResult<TunnelInterface> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ChimneyError::InterfaceAcquisitionFailed("permission denied".to_string()));
        }
        Ok(TunnelInterface::detached("chimney-test0", 1500))
    }
}

/// Observer keeping every snapshot it receives
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<StatusSnapshot>>,
    cond: Condvar,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshots(&self) -> Vec<StatusSnapshot> {
        self.seen.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.snapshots().iter().map(|s| s.state).collect()
    }

    pub fn pairs(&self) -> Vec<(ConnectionState, String)> {
        self.snapshots().into_iter().map(|s| (s.state, s.message)).collect()
    }

    /// Wait until a snapshot matching `pred` has been seen
    pub fn wait_for(&self, pred: impl Fn(&StatusSnapshot) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut seen = self.seen.lock().unwrap();
        loop {
            if seen.iter().any(&pred) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            seen = self.cond.wait_timeout(seen, deadline - now).unwrap().0;
        }
    }

    pub fn wait_for_state(&self, state: ConnectionState) -> bool {
        self.wait_for(|s| s.state == state)
    }
}

impl StatusObserver for Recorder {
    fn notify(&self, snapshot: &StatusSnapshot) -> ChimneyResult<()> {
        self.seen.lock().unwrap().push(snapshot.clone());
        self.cond.notify_all();
        Ok(())
    }
}

pub struct Harness {
    pub hub: Arc<StatusHub>,
    pub engine: Arc<FakeEngine>,
    pub interfaces: Arc<FakeInterfaces>,
    pub supervisor: ConnectionSupervisor,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    pub fn new(engine: Arc<FakeEngine>, interfaces: Arc<FakeInterfaces>) -> Self {
        Self::with_settings(engine, interfaces, SupervisorSettings::default())
    }

    pub fn with_settings(
        engine: Arc<FakeEngine>,
        interfaces: Arc<FakeInterfaces>,
        settings: SupervisorSettings,
    ) -> Self {
        let hub = Arc::new(StatusHub::new());
        let recorder = Recorder::new();
        hub.register(recorder.clone());
        let supervisor = ConnectionSupervisor::new(hub.clone(), engine.clone(), interfaces.clone(), settings);
        Self { hub, engine, interfaces, supervisor, recorder }
    }

    /// Wait for the worker thread to finish
    pub fn wait_idle(&self) {
        let deadline = Instant::now() + WAIT;
        while self.supervisor.is_worker_active() {
            assert!(Instant::now() < deadline, "worker did not exit");
            thread::sleep(Duration::from_millis(5));
        }
    }
}
