//! Connection supervisor
//!
//! Owns the single connection worker and drives the lifecycle state machine:
//!
//! ```text
//! Idle       --connect(valid)-->          Connecting
//! Idle       --connect(invalid)-->        InvalidConfig -> Stopped
//! Connecting --interface ready-->         Connecting ("Interface ready")
//! Connecting --engine ready-->            Connected
//! Connecting --failure-->                 Error -> Stopped
//! Connected  --engine exits on its own--> Disconnecting -> Stopped
//! Connected  --disconnect-->              Disconnecting -> Stopped
//! Stopped    --connect-->                 Connecting
//! ```
//!
//! Every transition is published to the [`StatusHub`]. The worker is a plain
//! thread because the engine call blocks for the lifetime of the connection.
//!
//! Two locks are involved, the worker slot here and the hub's own. They are
//! always taken in that order. The worker checks for cancellation and
//! publishes under the slot lock, and `disconnect` cancels and publishes
//! `Disconnecting` under the same lock, so once `Disconnecting` is out the
//! only thing a worker can still publish is its final `Stopped`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{EngineSession, TunnelEngine};
use crate::interface::InterfaceProvider;
use crate::profile::ConnectionProfile;
use crate::status::{ConnectionState, StatusHub, StatusSnapshot};
use crate::validation::sanitize_error_message;

pub const MSG_CONNECTING: &str = "Connecting...";
pub const MSG_INTERFACE_READY: &str = "Interface ready";
pub const MSG_CONNECTED: &str = "VPN Connected Successfully";
pub const MSG_DISCONNECTING: &str = "Disconnecting...";
pub const MSG_DISCONNECTED: &str = "Disconnected by user";
pub const MSG_INTERFACE_FAILED: &str = "Failed to establish interface";
pub const MSG_ENGINE_EXITED: &str = "Tunnel engine exited";

const WORKER_THREAD_NAME: &str = "chimney-worker";
const WATCHDOG_THREAD_NAME: &str = "chimney-stop-watchdog";

/// Supervisor timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// How long a disconnect waits for the engine before abandoning the attempt
    pub stop_timeout: Duration,
    /// Interval at which the stop request is re-sent while waiting
    pub stop_poll_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            stop_poll_interval: Duration::from_millis(200),
        }
    }
}

/// Lifetime worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub spawned: u64,
    pub completed: u64,
}

impl WorkerStats {
    /// Workers spawned but not yet finished
    pub fn live(&self) -> u64 {
        self.spawned - self.completed
    }
}

struct ActiveWorker {
    attempt_id: Uuid,
    cancel: CancellationToken,
    /// The stop watchdog gave up on this attempt and already published `Stopped`
    abandoned: bool,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct WorkerSlot {
    active: Option<ActiveWorker>,
    /// Handle of the last finished worker, joined lazily
    finished: Option<JoinHandle<()>>,
    stats: WorkerStats,
}

struct Shared {
    hub: Arc<StatusHub>,
    engine: Arc<dyn TunnelEngine>,
    interfaces: Arc<dyn InterfaceProvider>,
    settings: SupervisorSettings,
    slot: Mutex<WorkerSlot>,
}

impl Shared {
    fn lock_slot(&self) -> MutexGuard<'_, WorkerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish on behalf of an attempt
    ///
    /// Returns false without publishing once the attempt has been cancelled.
    fn publish_for(&self, attempt_id: Uuid, state: ConnectionState, message: &str) -> bool {
        let slot = self.lock_slot();
        match &slot.active {
            Some(worker) if worker.attempt_id == attempt_id && !worker.cancel.is_cancelled() => {
                self.hub.publish(state, message);
                true
            }
            _ => false,
        }
    }
}

/// How an attempt ended
#[derive(Debug)]
enum Outcome {
    Cancelled,
    Failed(String),
    EngineExited,
}

impl Outcome {
    fn message(&self) -> &str {
        match self {
            Outcome::Cancelled => MSG_DISCONNECTED,
            Outcome::Failed(message) => message,
            Outcome::EngineExited => MSG_ENGINE_EXITED,
        }
    }
}

/// Clears the slot and publishes the final `Stopped` when the worker exits
struct AttemptCleanup {
    shared: Arc<Shared>,
    attempt_id: Uuid,
    outcome: Outcome,
}

impl Drop for AttemptCleanup {
    fn drop(&mut self) {
        let mut slot = self.shared.lock_slot();
        let worker = match slot.active.take() {
            Some(worker) if worker.attempt_id == self.attempt_id => worker,
            other => {
                slot.active = other;
                warn!("Attempt {} finished but no longer owns the worker slot", self.attempt_id);
                return;
            }
        };

        slot.stats.completed += 1;
        slot.finished = worker.handle;

        if worker.abandoned {
            info!("Abandoned attempt {} finally exited", self.attempt_id);
            return;
        }

        let message = self.outcome.message();
        self.shared.hub.publish(ConnectionState::Stopped, message);
        info!("Attempt {} stopped: {}", self.attempt_id, message);
    }
}

/// Supervises the single connection worker
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    pub fn new(
        hub: Arc<StatusHub>,
        engine: Arc<dyn TunnelEngine>,
        interfaces: Arc<dyn InterfaceProvider>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                hub,
                engine,
                interfaces,
                settings,
                slot: Mutex::new(WorkerSlot::default()),
            }),
        }
    }

    /// Start a connection attempt
    ///
    /// Ignored while a worker is alive. An incomplete profile is reported as
    /// `InvalidConfig` followed by `Stopped` and no worker is started.
    pub fn connect(&self, profile: ConnectionProfile) {
        let mut slot = self.shared.lock_slot();

        if let Some(worker) = &slot.active {
            if worker.abandoned {
                warn!("Connect ignored: abandoned attempt {} has not exited yet", worker.attempt_id);
            } else {
                info!("Connect ignored: attempt {} is still active", worker.attempt_id);
            }
            return;
        }

        if let Err(e) = profile.validate() {
            let message = e.to_string();
            warn!("Rejecting connect: {}", message);
            self.shared.hub.publish(ConnectionState::InvalidConfig, message.as_str());
            self.shared.hub.publish(ConnectionState::Stopped, message);
            return;
        }

        if let Some(handle) = slot.finished.take() {
            if handle.join().is_err() {
                warn!("Previous connection worker panicked");
            }
        }

        let attempt_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.shared.hub.publish(ConnectionState::Connecting, MSG_CONNECTING);

        let shared = self.shared.clone();
        let token = cancel.clone();
        let profile = profile.normalized();
        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || run_worker(shared, attempt_id, token, profile));

        match spawned {
            Ok(handle) => {
                slot.stats.spawned += 1;
                slot.active = Some(ActiveWorker {
                    attempt_id,
                    cancel,
                    abandoned: false,
                    handle: Some(handle),
                });
                info!("Started connection attempt {}", attempt_id);
            }
            Err(e) => {
                let message = format!("Failed to start connection worker: {}", e);
                error!("{}", message);
                self.shared.hub.publish(ConnectionState::Error, message.as_str());
                self.shared.hub.publish(ConnectionState::Stopped, message);
            }
        }
    }

    /// Tear down the current attempt
    ///
    /// Returns immediately; the worker publishes `Stopped` once the engine
    /// has returned and the interface is released.
    pub fn disconnect(&self) {
        let mut slot = self.shared.lock_slot();

        let Some(worker) = slot.active.as_mut() else {
            if self.shared.hub.current_state() == ConnectionState::Stopped {
                debug!("Disconnect ignored: already stopped");
            } else {
                self.shared.hub.publish(ConnectionState::Stopped, MSG_DISCONNECTED);
            }
            return;
        };

        if worker.cancel.is_cancelled() {
            debug!("Disconnect ignored: attempt {} is already stopping", worker.attempt_id);
            return;
        }

        let attempt_id = worker.attempt_id;
        info!("Disconnecting attempt {}", attempt_id);
        worker.cancel.cancel();
        self.shared.hub.publish(ConnectionState::Disconnecting, MSG_DISCONNECTING);
        self.shared.engine.request_stop();
        drop(slot);

        self.spawn_stop_watchdog(attempt_id);
    }

    fn spawn_stop_watchdog(&self, attempt_id: Uuid) {
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(WATCHDOG_THREAD_NAME.to_string())
            .spawn(move || watch_stop(shared, attempt_id));
        if let Err(e) = spawned {
            warn!("Failed to start stop watchdog for attempt {}: {}", attempt_id, e);
        }
    }

    /// Latest published state
    pub fn current_state(&self) -> ConnectionState {
        self.shared.hub.current_state()
    }

    /// Latest published snapshot
    pub fn current_snapshot(&self) -> StatusSnapshot {
        self.shared.hub.current_snapshot()
    }

    /// Whether a worker thread is alive, abandoned ones included
    pub fn is_worker_active(&self) -> bool {
        self.shared.lock_slot().active.is_some()
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.shared.lock_slot().stats
    }

    pub fn hub(&self) -> &Arc<StatusHub> {
        &self.shared.hub
    }

    /// Disconnect and wait up to `timeout` for the worker to exit
    ///
    /// Returns false if a worker is still alive when the timeout expires.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.disconnect();

        let deadline = Instant::now() + timeout;
        let pause = self.shared.settings.stop_poll_interval.min(Duration::from_millis(20));
        loop {
            {
                let mut slot = self.shared.lock_slot();
                if slot.active.is_none() {
                    let handle = slot.finished.take();
                    drop(slot);
                    if let Some(handle) = handle {
                        if handle.join().is_err() {
                            warn!("Connection worker panicked");
                        }
                    }
                    return true;
                }
            }

            if Instant::now() >= deadline {
                warn!("Connection worker still running after {:?}", timeout);
                return false;
            }
            thread::sleep(pause);
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if self.is_worker_active() {
            debug!("Supervisor dropped with a live worker, disconnecting");
            self.disconnect();
        }
    }
}

fn run_worker(shared: Arc<Shared>, attempt_id: Uuid, cancel: CancellationToken, profile: ConnectionProfile) {
    let mut cleanup = AttemptCleanup {
        shared: shared.clone(),
        attempt_id,
        outcome: Outcome::Cancelled,
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| drive_attempt(&shared, attempt_id, &cancel, &profile)));

    cleanup.outcome = match result {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = sanitize_error_message(&format!("Unexpected failure: {}", panic_message(&*payload)));
            error!("Attempt {}: {}", attempt_id, message);
            if shared.publish_for(attempt_id, ConnectionState::Error, &message) {
                Outcome::Failed(message)
            } else {
                Outcome::Cancelled
            }
        }
    };
}

fn drive_attempt(
    shared: &Shared,
    attempt_id: Uuid,
    cancel: &CancellationToken,
    profile: &ConnectionProfile,
) -> Outcome {
    if cancel.is_cancelled() {
        return Outcome::Cancelled;
    }

    let interface = match shared.interfaces.acquire(profile) {
        Ok(interface) => interface,
        Err(e) => {
            if cancel.is_cancelled() {
                debug!("Attempt {}: interface setup interrupted: {}", attempt_id, e);
                return Outcome::Cancelled;
            }
            error!("Attempt {}: {}", attempt_id, e);
            if !shared.publish_for(attempt_id, ConnectionState::Error, MSG_INTERFACE_FAILED) {
                return Outcome::Cancelled;
            }
            return Outcome::Failed(MSG_INTERFACE_FAILED.to_string());
        }
    };

    info!("Attempt {}: interface {} ready", attempt_id, interface.name());
    if !shared.publish_for(attempt_id, ConnectionState::Connecting, MSG_INTERFACE_READY) {
        return Outcome::Cancelled;
    }

    let ready = AtomicBool::new(false);
    let on_ready = || {
        if !ready.swap(true, Ordering::SeqCst)
            && shared.publish_for(attempt_id, ConnectionState::Connected, MSG_CONNECTED)
        {
            info!("Attempt {}: connected", attempt_id);
        }
    };
    if cancel.is_cancelled() {
        return Outcome::Cancelled;
    }
    let session = EngineSession::new(attempt_id, &interface, profile, &on_ready).with_cancel(cancel);
    let result = shared.engine.start(&session);

    // Whatever the engine reported, a requested stop is not a failure
    if cancel.is_cancelled() {
        return Outcome::Cancelled;
    }

    match result {
        Err(e) => {
            let message = sanitize_error_message(&e.to_string());
            error!("Attempt {}: {}", attempt_id, message);
            if shared.publish_for(attempt_id, ConnectionState::Error, &message) {
                Outcome::Failed(message)
            } else {
                Outcome::Cancelled
            }
        }
        Ok(()) if ready.load(Ordering::SeqCst) => {
            info!("Attempt {}: tunnel engine exited on its own", attempt_id);
            if shared.publish_for(attempt_id, ConnectionState::Disconnecting, MSG_ENGINE_EXITED) {
                Outcome::EngineExited
            } else {
                Outcome::Cancelled
            }
        }
        Ok(()) => {
            // The engine launched and handed control back; hold the interface
            // until someone disconnects
            on_ready();
            debug!("Attempt {}: engine returned, holding session", attempt_id);
            futures::executor::block_on(cancel.cancelled());
            Outcome::Cancelled
        }
    }
}

fn watch_stop(shared: Arc<Shared>, attempt_id: Uuid) {
    let timeout = shared.settings.stop_timeout;
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(shared.settings.stop_poll_interval.min(remaining));

        let mut slot = shared.lock_slot();
        let Some(worker) = slot.active.as_mut().filter(|w| w.attempt_id == attempt_id) else {
            return;
        };

        if Instant::now() >= deadline {
            worker.abandoned = true;
            let message = format!("Tunnel engine did not stop within {:?}; connection abandoned", timeout);
            warn!("Attempt {}: {}", attempt_id, message);
            shared.hub.publish(ConnectionState::Stopped, message);
            return;
        }

        debug!("Attempt {}: engine still running, repeating stop request", attempt_id);
        shared.engine.request_stop();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
