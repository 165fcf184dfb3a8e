//! Connection status: the authoritative snapshot and its fan-out
//!
//! [`StatusHub`] is the single source of truth for the connection state. It
//! caches the latest [`StatusSnapshot`] and pushes every change to the
//! registered observers. Registration delivers the cached snapshot before it
//! returns, so an observer never sees a gap between attaching and its first
//! knowledge of the state.
//!
//! Publication, registration and removal share one mutex, which linearizes
//! them: every observer sees a contiguous run of sequence numbers starting at
//! the snapshot it was caught up with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::error::{ChimneyError, ChimneyResult};

/// Message carried by the initial snapshot
pub const INITIAL_MESSAGE: &str = "Initializing...";

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing has happened yet
    Idle,
    /// A worker is setting up the interface and engine
    Connecting,
    /// The tunnel engine is up
    Connected,
    /// Teardown requested, cleanup pending
    Disconnecting,
    /// No worker is running
    Stopped,
    /// The last connect was rejected because the profile was incomplete
    InvalidConfig,
    /// The last attempt failed
    Error,
}

impl ConnectionState {
    /// Check if a connection attempt is in flight or established
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting...",
            ConnectionState::Stopped => "Stopped",
            ConnectionState::InvalidConfig => "Invalid configuration",
            ConnectionState::Error => "Error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Immutable, sequenced state+message pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub message: String,
    /// Bumped by one on every published change
    pub sequence: u64,
}

impl StatusSnapshot {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Idle,
            message: INITIAL_MESSAGE.to_string(),
            sequence: 0,
        }
    }

    fn same_status(&self, state: ConnectionState, message: &str) -> bool {
        self.state == state && self.message == message
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}: {}", self.sequence, self.state, self.message)
    }
}

/// Identity of a registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// Receiver of status changes
///
/// `notify` is called with the hub lock held and must not block; hand the
/// snapshot off to a channel or similar. Returning an error marks the
/// observer dead and it is removed without retry.
pub trait StatusObserver: Send + Sync {
    fn notify(&self, snapshot: &StatusSnapshot) -> ChimneyResult<()>;
}

/// Snapshots a [`ChannelObserver`] buffers before it counts as stalled
pub const OBSERVER_QUEUE_CAPACITY: usize = 256;

/// Observer backed by a bounded channel
///
/// Delivery fails once the receiving half is dropped, which is how a
/// departed subscriber (a closed socket, a dropped UI handle) is detected.
/// It also fails when the queue is full: a receiver that stopped draining is
/// dropped by the hub instead of buffering without limit. Either way the
/// sender goes away with the observer and the receiver sees the channel close.
pub struct ChannelObserver {
    tx: mpsc::Sender<StatusSnapshot>,
}

impl ChannelObserver {
    /// Create an observer and the receiver its snapshots arrive on
    pub fn new() -> (Self, mpsc::Receiver<StatusSnapshot>) {
        Self::with_capacity(OBSERVER_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<StatusSnapshot>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl StatusObserver for ChannelObserver {
    fn notify(&self, snapshot: &StatusSnapshot) -> ChimneyResult<()> {
        self.tx.try_send(snapshot.clone()).map_err(|e| match e {
            TrySendError::Full(_) => ChimneyError::ObserverDeliveryFailed(format!(
                "receiver fell {} snapshots behind",
                self.tx.max_capacity()
            )),
            TrySendError::Closed(_) => ChimneyError::ObserverDeliveryFailed("receiver closed".to_string()),
        })
    }
}

struct Registered {
    id: ObserverId,
    observer: Arc<dyn StatusObserver>,
}

struct HubInner {
    snapshot: StatusSnapshot,
    observers: Vec<Registered>,
}

/// Latest status plus the set of observers it is pushed to
pub struct StatusHub {
    inner: Mutex<HubInner>,
    next_id: AtomicU64,
}

impl StatusHub {
    /// Create a hub holding the initial `Idle` snapshot
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                snapshot: StatusSnapshot::initial(),
                observers: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a new state+message pair
    ///
    /// Identical consecutive pairs are dropped without bumping the sequence.
    /// Returns whether anything was published.
    pub fn publish(&self, state: ConnectionState, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut inner = self.lock();

        if inner.snapshot.same_status(state, &message) {
            debug!("Status unchanged ({}: {}), skipping publish", state, message);
            return false;
        }

        let snapshot = StatusSnapshot {
            state,
            message,
            sequence: inner.snapshot.sequence + 1,
        };
        debug!("Publishing status {}", snapshot);

        inner.observers.retain(|registered| match registered.observer.notify(&snapshot) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping {}: {}", registered.id, e);
                false
            }
        });
        inner.snapshot = snapshot;
        true
    }

    /// Attach an observer and catch it up with the current snapshot
    ///
    /// If the catch-up delivery fails the observer is not retained; the
    /// returned id is then already unregistered.
    pub fn register(&self, observer: Arc<dyn StatusObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.lock();

        match observer.notify(&inner.snapshot) {
            Ok(()) => {
                inner.observers.push(Registered { id, observer });
                debug!("Registered {} ({} attached)", id, inner.observers.len());
            }
            Err(e) => warn!("Catch-up delivery to {} failed: {}", id, e),
        }
        id
    }

    /// Detach an observer; returns whether it was still attached
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|registered| registered.id != id);
        let removed = inner.observers.len() != before;
        if removed {
            debug!("Unregistered {}", id);
        }
        removed
    }

    /// Copy of the cached snapshot
    pub fn current_snapshot(&self) -> StatusSnapshot {
        self.lock().snapshot.clone()
    }

    /// State of the cached snapshot
    pub fn current_state(&self) -> ConnectionState {
        self.lock().snapshot.state
    }

    /// Number of attached observers
    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}
