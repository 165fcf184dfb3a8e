//! Error types for chimney

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChimneyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Connection profile is missing required fields or has malformed values
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    /// The platform refused or failed to create the tunnel interface
    #[error("Failed to establish interface: {0}")]
    InterfaceAcquisitionFailed(String),
    /// The tunnel engine raised an error instead of exiting cleanly
    #[error("Tunnel engine failure: {0}")]
    EngineFailure(String),
    /// A single observer could not be notified
    #[error("Observer delivery failed: {0}")]
    ObserverDeliveryFailed(String),
    /// Daemon configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", .code.map(|c| format!(" with code {}", c)).unwrap_or_default())]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },
    /// Service error (control socket, engine process)
    #[error("Service error: {0}")]
    ServiceError(String),
    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Not supported on this platform
    #[error("Not supported: {0}")]
    NotSupported(String),
    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Unexpected message on the control socket
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for ChimneyError {
    fn from(error: serde_json::Error) -> Self {
        ChimneyError::ParseError(error.to_string())
    }
}

pub type ChimneyResult<T> = Result<T, ChimneyError>;
