//! chimney - proxy-backed VPN connection supervisor
//!
//! Runs one cancellable tunnel connection at a time and keeps any number of
//! observers in sync with its state:
//! - Connection supervisor and its single worker thread
//! - Status hub with catch-up delivery to late observers
//! - TUN interface acquisition
//! - External tunnel engine process
//! - Persisted connection profile
//! - Unix socket control surface

pub mod error;
pub mod validation;
pub mod config;
pub mod profile;
pub mod status;
pub mod interface;
pub mod engine;
pub mod supervisor;
pub mod store;

#[cfg(unix)]
pub mod control;

// Re-export commonly used types
pub use error::{ChimneyError, ChimneyResult};
pub use config::{ChimneyConfig, ConfigPaths, EngineSettings, SupervisorConfig, TunnelSettings};
pub use profile::ConnectionProfile;
pub use status::{
    ChannelObserver, ConnectionState, ObserverId, StatusHub, StatusObserver, StatusSnapshot,
    OBSERVER_QUEUE_CAPACITY,
};
pub use interface::{InterfaceProvider, TunDeviceProvider, TunnelInterface};
pub use engine::{EngineSession, ProcessEngine, TunnelEngine};
pub use supervisor::{ConnectionSupervisor, SupervisorSettings, WorkerStats};
pub use store::{ConfigStore, FileProfileStore, MemoryProfileStore, ProfileId};

#[cfg(unix)]
pub use control::{ControlClient, ControlRequest, ControlResponse, ControlServer, StatusSubscription};
