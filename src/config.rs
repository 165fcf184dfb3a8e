//! Configuration management for chimney

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{ChimneyError, ChimneyResult};
use crate::supervisor::SupervisorSettings;
use crate::validation;

/// Default location of the daemon configuration file
pub const DEFAULT_CONFIG_FILE: &str = "/etc/chimney/chimney.toml";

/// Main chimney configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChimneyConfig {
    /// Configuration file paths
    #[serde(default)]
    pub paths: ConfigPaths,
    /// Tunnel interface setup
    #[serde(default)]
    pub tunnel: TunnelSettings,
    /// External tunnel engine
    #[serde(default)]
    pub engine: EngineSettings,
    /// Connection supervisor timings
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Base configuration directory
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Runtime state directory
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Control socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Persisted connection profile
    #[serde(default = "default_profile_path")]
    pub profile_path: PathBuf,
}

/// Addressing applied to the tunnel interface
///
/// Applied verbatim; chimney does not choose addresses or routes itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Kernel name template, `%d` is replaced by the first free index
    #[serde(default = "default_name_template")]
    pub name_template: String,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    /// Route sent through the tunnel, e.g. `0.0.0.0/0`
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// DNS server used when the profile does not name one
    #[serde(default = "default_fallback_dns")]
    pub fallback_dns: String,
    /// Register the DNS server with systemd-resolved
    #[serde(default = "default_true")]
    pub apply_dns: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Engine executable
    #[serde(default = "default_engine_program")]
    pub program: PathBuf,
    /// Placed before the generated arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How long a disconnect waits for the engine before abandoning it
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Interval at which stop requests are re-sent
    #[serde(default = "default_stop_poll_interval_ms")]
    pub stop_poll_interval_ms: u64,
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/chimney")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/run/chimney")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/chimney/chimney.sock")
}

fn default_profile_path() -> PathBuf {
    PathBuf::from("/etc/chimney/profile.toml")
}

fn default_name_template() -> String {
    "chimney%d".to_string()
}

fn default_address() -> String {
    "10.8.0.2".to_string()
}

fn default_prefix_len() -> u8 {
    24
}

fn default_mtu() -> u32 {
    1500
}

fn default_fallback_dns() -> String {
    "1.1.1.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_engine_program() -> PathBuf {
    PathBuf::from("/usr/lib/chimney/chimney-engine")
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_stop_poll_interval_ms() -> u64 {
    200
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            state_dir: default_state_dir(),
            socket_path: default_socket_path(),
            profile_path: default_profile_path(),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            name_template: default_name_template(),
            address: default_address(),
            prefix_len: default_prefix_len(),
            route: None,
            mtu: default_mtu(),
            fallback_dns: default_fallback_dns(),
            apply_dns: default_true(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout_secs(),
            stop_poll_interval_ms: default_stop_poll_interval_ms(),
        }
    }
}

impl SupervisorConfig {
    /// Timings in the form the supervisor takes them
    pub fn settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            stop_poll_interval: Duration::from_millis(self.stop_poll_interval_ms),
        }
    }
}

impl ChimneyConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> ChimneyResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ChimneyError::ConfigError(format!("Failed to read config: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ChimneyError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> ChimneyResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            info!("No configuration at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> ChimneyResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ChimneyError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| ChimneyError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Check values that end up on `ip` command lines or drive timers
    pub fn validate(&self) -> ChimneyResult<()> {
        validation::validate_interface_template(&self.tunnel.name_template)?;
        let address = validation::validate_ip_address(&self.tunnel.address)?;
        validation::validate_prefix_len(self.tunnel.prefix_len, address.is_ipv6())?;
        if let Some(route) = &self.tunnel.route {
            validation::validate_cidr(route)?;
        }
        validation::validate_mtu(self.tunnel.mtu)?;
        validation::validate_ip_address(&self.tunnel.fallback_dns)?;

        for arg in &self.engine.extra_args {
            validation::sanitize_config_value(arg)?;
        }

        if self.supervisor.stop_timeout_secs == 0 {
            return Err(ChimneyError::ConfigError(
                "supervisor.stop_timeout_secs must be greater than zero".to_string()
            ));
        }
        if self.supervisor.stop_poll_interval_ms == 0 {
            return Err(ChimneyError::ConfigError(
                "supervisor.stop_poll_interval_ms must be greater than zero".to_string()
            ));
        }
        Ok(())
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> ChimneyResult<()> {
        let socket_dir = self.paths.socket_path.parent();
        let profile_dir = self.paths.profile_path.parent();
        let dirs = [Some(self.paths.config_dir.as_path()), Some(self.paths.state_dir.as_path()), socket_dir, profile_dir];

        for dir in dirs.into_iter().flatten().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| ChimneyError::ConfigError(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }
}
