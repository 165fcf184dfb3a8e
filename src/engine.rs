//! Tunnel engine contract and the external-process implementation

use std::io;
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::error::{ChimneyError, ChimneyResult};
use crate::interface::TunnelInterface;
use crate::profile::ConnectionProfile;

/// Environment variable carrying the proxy user name
pub const ENV_PROXY_USER: &str = "CHIMNEY_PROXY_USER";
/// Environment variable carrying the proxy password
pub const ENV_PROXY_PASS: &str = "CHIMNEY_PROXY_PASS";

/// How often a running engine process is checked for exit
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything an engine needs for one connection attempt
pub struct EngineSession<'a> {
    attempt_id: Uuid,
    interface: &'a TunnelInterface,
    profile: &'a ConnectionProfile,
    on_ready: &'a dyn Fn(),
    cancel: Option<&'a CancellationToken>,
}

impl<'a> EngineSession<'a> {
    pub fn new(
        attempt_id: Uuid,
        interface: &'a TunnelInterface,
        profile: &'a ConnectionProfile,
        on_ready: &'a dyn Fn(),
    ) -> Self {
        Self { attempt_id, interface, profile, on_ready, cancel: None }
    }

    /// Tie the session to the attempt's cancellation token
    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Whether the attempt was cancelled, possibly before `start` was reached
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancellationToken::is_cancelled)
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn interface(&self) -> &TunnelInterface {
        self.interface
    }

    pub fn profile(&self) -> &ConnectionProfile {
        self.profile
    }

    /// Report that the tunnel is carrying traffic
    ///
    /// Only the first call has an effect.
    pub fn mark_ready(&self) {
        (self.on_ready)()
    }
}

/// External data-plane component
///
/// `start` blocks the calling thread until the engine stops. It returns `Ok`
/// on a graceful stop and an error on failure. `request_stop` may be called
/// from any thread, any number of times, including before `start`.
pub trait TunnelEngine: Send + Sync {
    fn start(&self, session: &EngineSession<'_>) -> ChimneyResult<()>;

    fn request_stop(&self);
}

#[derive(Debug, Default)]
struct EngineRun {
    pid: Option<u32>,
    stop_requested: bool,
}

/// Runs an external tun2socks-style engine program
///
/// The interface descriptor is inherited by the child and named on its
/// command line; credentials are passed through the environment.
pub struct ProcessEngine {
    settings: EngineSettings,
    run: Mutex<EngineRun>,
}

impl ProcessEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            run: Mutex::new(EngineRun::default()),
        }
    }

    /// Check whether the engine program exists
    pub fn is_available(&self) -> bool {
        self.settings.program.is_file()
    }

    fn lock(&self) -> MutexGuard<'_, EngineRun> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Command line for the engine: configured arguments, then the session's
    pub fn arguments(&self, session: &EngineSession<'_>) -> Vec<String> {
        let interface = session.interface();
        let profile = session.profile();
        let mut args = self.settings.extra_args.clone();

        if let Some(fd) = interface.raw_fd() {
            args.push("--tun-fd".to_string());
            args.push(fd.to_string());
        }
        args.extend([
            "--tun-name".to_string(), interface.name().to_string(),
            "--mtu".to_string(), interface.mtu().to_string(),
            "--tcp-proxy".to_string(), profile.tcp_proxy_url.clone(),
            "--udp-proxy".to_string(), profile.udp_proxy_url.clone(),
            "--dns".to_string(), profile.dns_address.clone(),
        ]);
        args
    }

    fn command(&self, session: &EngineSession<'_>) -> Command {
        let mut command = Command::new(&self.settings.program);
        command
            .args(self.arguments(session))
            .stdin(Stdio::null())
            .env_remove(ENV_PROXY_USER)
            .env_remove(ENV_PROXY_PASS);

        let profile = session.profile();
        if profile.has_credentials() {
            command.env(ENV_PROXY_USER, &profile.user).env(ENV_PROXY_PASS, &profile.pass);
        }

        if let Some(fd) = session.interface().raw_fd() {
            inherit_fd(&mut command, fd);
        }
        command
    }
}

#[cfg(unix)]
fn inherit_fd(command: &mut Command, fd: std::os::fd::RawFd) {
    use std::os::unix::process::CommandExt;

    // SAFETY: fcntl is async-signal-safe and only touches the child's copy
    unsafe {
        command.pre_exec(move || {
            if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

impl TunnelEngine for ProcessEngine {
    fn start(&self, session: &EngineSession<'_>) -> ChimneyResult<()> {
        let program = self.settings.program.display().to_string();
        let mut command = self.command(session);

        let mut child = {
            let mut run = self.lock();
            // A stop aimed at an earlier attempt must not leak into this one
            run.stop_requested = false;
            // A disconnect after this check waits on the lock and finds the pid
            if session.is_cancelled() {
                debug!("Attempt {}: cancelled before the engine was started", session.attempt_id());
                return Ok(());
            }
            let child = command.spawn().map_err(|e| {
                ChimneyError::EngineFailure(format!("Failed to start {}: {}", program, e))
            })?;
            run.pid = Some(child.id());
            child
        };

        info!(
            "Attempt {}: started {} (pid {}) on {}",
            session.attempt_id(), program, child.id(), session.interface().name()
        );
        session.mark_ready();

        // Reap only under the lock, so request_stop never signals a recycled pid
        let (status, stop_requested) = loop {
            {
                let mut run = self.lock();
                match child.try_wait() {
                    Ok(None) => {}
                    Ok(Some(status)) => {
                        run.pid = None;
                        break (Ok(status), run.stop_requested);
                    }
                    Err(e) => {
                        run.pid = None;
                        break (Err(e), run.stop_requested);
                    }
                }
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        };

        let status = status.map_err(|e| {
            ChimneyError::EngineFailure(format!("Failed to wait for {}: {}", program, e))
        })?;

        if status.success() || stop_requested {
            debug!("Engine {} exited with {}", program, status);
            Ok(())
        } else {
            Err(ChimneyError::EngineFailure(format!("{} exited with {}", program, status)))
        }
    }

    fn request_stop(&self) {
        let mut run = self.lock();
        run.stop_requested = true;

        if let Some(pid) = run.pid {
            debug!("Sending SIGTERM to engine pid {}", pid);
            // SAFETY: plain syscall; the child is only reaped under this lock, so the pid is live
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                warn!("Failed to signal engine pid {}: {}", pid, io::Error::last_os_error());
            }
        }
    }
}
