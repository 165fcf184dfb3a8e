//! Control socket for IPC with the running daemon
//!
//! Newline-delimited JSON over a Unix domain socket. A connection carries
//! any number of request/response pairs; after a `subscribe` request it also
//! receives a `snapshot` message for every status change, starting with the
//! current one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ChimneyError, ChimneyResult};
use crate::profile::ConnectionProfile;
use crate::status::{ChannelObserver, ObserverId, StatusSnapshot};
use crate::store::{ConfigStore, ProfileId};
use crate::supervisor::ConnectionSupervisor;
use crate::validation::sanitize_error_message;

/// Default socket path for the control socket
pub const DEFAULT_SOCKET_PATH: &str = "/run/chimney/chimney.sock";

/// How long the client waits for a response
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Request messages sent to the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRequest {
    /// Start a connection; without a profile the stored one is used
    #[serde(rename = "connect")]
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<ConnectionProfile>,
    },

    /// Tear down the current connection
    #[serde(rename = "disconnect")]
    Disconnect,

    /// Get the current status snapshot
    #[serde(rename = "status")]
    Status,

    /// Receive every status change on this connection
    #[serde(rename = "subscribe")]
    Subscribe,

    /// Stop receiving status changes
    #[serde(rename = "unsubscribe")]
    Unsubscribe,

    /// Validate and persist a connection profile
    #[serde(rename = "save_profile")]
    SaveProfile { profile: ConnectionProfile },

    /// Read the persisted connection profile
    #[serde(rename = "load_profile")]
    LoadProfile,
}

/// Response messages from the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlResponse {
    /// Success acknowledgment
    #[serde(rename = "ok")]
    Ok,

    /// Status response
    #[serde(rename = "status")]
    Status { snapshot: StatusSnapshot },

    /// Subscription accepted
    #[serde(rename = "subscribed")]
    Subscribed { observer_id: ObserverId },

    /// Pushed to subscribers on every status change
    #[serde(rename = "snapshot")]
    Snapshot { snapshot: StatusSnapshot },

    #[serde(rename = "profile_saved")]
    ProfileSaved { id: ProfileId },

    #[serde(rename = "profile")]
    Profile {
        #[serde(default)]
        profile: Option<ConnectionProfile>,
    },

    /// Error response
    #[serde(rename = "error")]
    Error { message: String },
}

impl ControlResponse {
    fn error(e: impl std::fmt::Display) -> Self {
        ControlResponse::Error {
            message: sanitize_error_message(&e.to_string()),
        }
    }
}

struct Subscription {
    observer_id: ObserverId,
    rx: mpsc::Receiver<StatusSnapshot>,
}

/// Control socket server
pub struct ControlServer {
    socket_path: PathBuf,
    supervisor: Arc<ConnectionSupervisor>,
    store: Arc<dyn ConfigStore>,
}

impl ControlServer {
    /// Create a new control server
    pub fn new(
        socket_path: impl AsRef<Path>,
        supervisor: Arc<ConnectionSupervisor>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            supervisor,
            store,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale one
    pub fn bind(&self) -> ChimneyResult<UnixListener> {
        if self.socket_path.exists() {
            debug!("Removing stale control socket {:?}", self.socket_path);
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            ChimneyError::ServiceError(format!("Failed to bind control socket {:?}: {}", self.socket_path, e))
        })?;

        // Owner read/write only
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        info!("Control socket listening on {:?}", self.socket_path);
        Ok(listener)
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn serve(&self, listener: UnixListener, shutdown: CancellationToken) -> ChimneyResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Control socket shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let supervisor = self.supervisor.clone();
                        let store = self.store.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, supervisor, store, shutdown).await {
                                debug!("Control connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Control socket accept error: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Bind and serve
    pub async fn start(&self, shutdown: CancellationToken) -> ChimneyResult<()> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

async fn handle_connection(
    stream: UnixStream,
    supervisor: Arc<ConnectionSupervisor>,
    store: Arc<dyn ConfigStore>,
    shutdown: CancellationToken,
) -> ChimneyResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut subscription: Option<Subscription> = None;

    let result = loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    // Client disconnected
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<ControlRequest>(line.trim()) {
                    Ok(request) => handle_request(request, &supervisor, &store, &mut subscription).await,
                    Err(e) => ControlResponse::error(format!("Invalid request: {}", e)),
                };
                if let Err(e) = write_message(&mut writer, &response).await {
                    break Err(e);
                }
            }
            snapshot = next_snapshot(&mut subscription) => {
                let Some(snapshot) = snapshot else {
                    // The hub dropped this observer
                    warn!("Control subscriber fell behind, closing its connection");
                    break Ok(());
                };
                let message = ControlResponse::Snapshot { snapshot };
                let push = write_message(&mut writer, &message);
                match tokio::time::timeout(RESPONSE_TIMEOUT, push).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(_) => break Err(ChimneyError::Timeout("Control subscriber stopped reading".to_string())),
                }
            }
            _ = shutdown.cancelled() => break Ok(()),
        }
    };

    if let Some(subscription) = subscription {
        supervisor.hub().unregister(subscription.observer_id);
    }
    result
}

async fn next_snapshot(subscription: &mut Option<Subscription>) -> Option<StatusSnapshot> {
    match subscription {
        Some(subscription) => subscription.rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_request(
    request: ControlRequest,
    supervisor: &Arc<ConnectionSupervisor>,
    store: &Arc<dyn ConfigStore>,
    subscription: &mut Option<Subscription>,
) -> ControlResponse {
    match request {
        ControlRequest::Connect { profile } => {
            let profile = match profile {
                Some(profile) => profile,
                None => match store.load().await {
                    Ok(stored) => stored.unwrap_or_else(|| {
                        debug!("No stored profile, connecting with an empty one");
                        ConnectionProfile::default()
                    }),
                    Err(e) => return ControlResponse::error(e),
                },
            };

            // May join the previous worker thread
            let supervisor = supervisor.clone();
            match tokio::task::spawn_blocking(move || supervisor.connect(profile)).await {
                Ok(()) => ControlResponse::Ok,
                Err(e) => ControlResponse::error(format!("Connect failed: {}", e)),
            }
        }
        ControlRequest::Disconnect => {
            supervisor.disconnect();
            ControlResponse::Ok
        }
        ControlRequest::Status => ControlResponse::Status {
            snapshot: supervisor.current_snapshot(),
        },
        ControlRequest::Subscribe => {
            if let Some(existing) = subscription {
                return ControlResponse::Subscribed { observer_id: existing.observer_id };
            }
            let (observer, rx) = ChannelObserver::new();
            let observer_id = supervisor.hub().register(Arc::new(observer));
            debug!("Control client subscribed as {}", observer_id);
            *subscription = Some(Subscription { observer_id, rx });
            ControlResponse::Subscribed { observer_id }
        }
        ControlRequest::Unsubscribe => {
            if let Some(existing) = subscription.take() {
                supervisor.hub().unregister(existing.observer_id);
            }
            ControlResponse::Ok
        }
        ControlRequest::SaveProfile { profile } => {
            let profile = profile.normalized();
            if let Err(e) = profile.validate_strict() {
                return ControlResponse::error(e);
            }
            match store.save(&profile).await {
                Ok(id) => ControlResponse::ProfileSaved { id },
                Err(e) => ControlResponse::error(e),
            }
        }
        ControlRequest::LoadProfile => match store.load().await {
            Ok(profile) => ControlResponse::Profile { profile },
            Err(e) => ControlResponse::error(e),
        },
    }
}

async fn write_message<W, T>(writer: &mut W, message: &T) -> ChimneyResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Control socket client
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    /// Create a new control client
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: RESPONSE_TIMEOUT,
        }
    }

    /// Override the response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn open(&self) -> ChimneyResult<(Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf)> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            ChimneyError::ServiceError(format!(
                "Failed to connect to control socket at {:?}: {}. Is chimneyd running?",
                self.socket_path, e
            ))
        })?;
        let (reader, writer) = stream.into_split();
        Ok((BufReader::new(reader).lines(), writer))
    }

    async fn read_response(&self, lines: &mut Lines<BufReader<OwnedReadHalf>>) -> ChimneyResult<ControlResponse> {
        let line = tokio::time::timeout(self.timeout, lines.next_line())
            .await
            .map_err(|_| ChimneyError::Timeout("Timeout waiting for response".to_string()))??
            .ok_or_else(|| ChimneyError::Protocol("Connection closed before a response".to_string()))?;

        serde_json::from_str(line.trim())
            .map_err(|e| ChimneyError::Protocol(format!("Invalid response: {}", e)))
    }

    /// Send a request and get a response
    pub async fn request(&self, request: ControlRequest) -> ChimneyResult<ControlResponse> {
        let (mut lines, mut writer) = self.open().await?;
        write_message(&mut writer, &request).await?;
        self.read_response(&mut lines).await
    }

    /// Ask the daemon to connect, with the stored profile when `profile` is `None`
    pub async fn connect(&self, profile: Option<ConnectionProfile>) -> ChimneyResult<()> {
        expect_ok(self.request(ControlRequest::Connect { profile }).await?)
    }

    pub async fn disconnect(&self) -> ChimneyResult<()> {
        expect_ok(self.request(ControlRequest::Disconnect).await?)
    }

    /// Get the current status snapshot
    pub async fn status(&self) -> ChimneyResult<StatusSnapshot> {
        match self.request(ControlRequest::Status).await? {
            ControlResponse::Status { snapshot } => Ok(snapshot),
            other => Err(unexpected(other)),
        }
    }

    pub async fn save_profile(&self, profile: ConnectionProfile) -> ChimneyResult<ProfileId> {
        match self.request(ControlRequest::SaveProfile { profile }).await? {
            ControlResponse::ProfileSaved { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn load_profile(&self) -> ChimneyResult<Option<ConnectionProfile>> {
        match self.request(ControlRequest::LoadProfile).await? {
            ControlResponse::Profile { profile } => Ok(profile),
            other => Err(unexpected(other)),
        }
    }

    /// Open a connection that receives every status change
    pub async fn subscribe(&self) -> ChimneyResult<StatusSubscription> {
        let (mut lines, mut writer) = self.open().await?;
        write_message(&mut writer, &ControlRequest::Subscribe).await?;

        match self.read_response(&mut lines).await? {
            ControlResponse::Subscribed { observer_id } => Ok(StatusSubscription {
                observer_id,
                lines,
                writer,
                last_sequence: None,
            }),
            other => Err(unexpected(other)),
        }
    }
}

fn expect_ok(response: ControlResponse) -> ChimneyResult<()> {
    match response {
        ControlResponse::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: ControlResponse) -> ChimneyError {
    match response {
        ControlResponse::Error { message } => ChimneyError::ServiceError(message),
        other => ChimneyError::Protocol(format!("Unexpected response: {:?}", other)),
    }
}

/// Stream of status snapshots from the daemon
///
/// Snapshots arrive in order; anything at or below the last seen sequence
/// is discarded.
pub struct StatusSubscription {
    observer_id: ObserverId,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    last_sequence: Option<u64>,
}

impl StatusSubscription {
    pub fn observer_id(&self) -> ObserverId {
        self.observer_id
    }

    /// Next snapshot, or `None` once the daemon closes the connection
    pub async fn next(&mut self) -> ChimneyResult<Option<StatusSnapshot>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str(line.trim())? {
                ControlResponse::Snapshot { snapshot } => {
                    if self.last_sequence.is_some_and(|last| snapshot.sequence <= last) {
                        debug!("Discarding stale snapshot {}", snapshot);
                        continue;
                    }
                    self.last_sequence = Some(snapshot.sequence);
                    return Ok(Some(snapshot));
                }
                ControlResponse::Error { message } => return Err(ChimneyError::ServiceError(message)),
                other => debug!("Ignoring {:?} on subscription", other),
            }
        }
    }

    /// Like [`next`](Self::next), but gives up after `timeout`
    pub async fn next_within(&mut self, timeout: Duration) -> ChimneyResult<Option<StatusSnapshot>> {
        tokio::time::timeout(timeout, self.next())
            .await
            .map_err(|_| ChimneyError::Timeout(format!("No status change within {:?}", timeout)))?
    }

    /// Detach from the daemon's observer list
    pub async fn unsubscribe(mut self) -> ChimneyResult<()> {
        write_message(&mut self.writer, &ControlRequest::Unsubscribe).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
