//! Persisted connection profile
//!
//! A single active profile is stored. Saving over an existing record keeps
//! its id; the first save gets id 1.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{ChimneyError, ChimneyResult};
use crate::profile::ConnectionProfile;

/// Identifier of the stored profile record
pub type ProfileId = u64;

const FIRST_PROFILE_ID: ProfileId = 1;

/// Permissions for the profile file, which holds proxy credentials
#[cfg(unix)]
const PROFILE_FILE_MODE: u32 = 0o600;

/// Storage for the single active connection profile
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Insert or replace the stored profile
    async fn save(&self, profile: &ConnectionProfile) -> ChimneyResult<ProfileId>;

    /// The stored profile, if any
    async fn load(&self) -> ChimneyResult<Option<ConnectionProfile>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileRecord {
    id: ProfileId,
    profile: ConnectionProfile,
}

/// Profile stored as a TOML file
pub struct FileProfileStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_record(&self) -> ChimneyResult<Option<ProfileRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ChimneyError::ConfigError(format!(
                    "Failed to read profile from {:?}: {}", self.path, e
                )))
            }
        };

        toml::from_str(&content)
            .map(Some)
            .map_err(|e| ChimneyError::ConfigError(format!("Failed to parse profile {:?}: {}", self.path, e)))
    }

    async fn write_record(&self, record: &ProfileRecord) -> ChimneyResult<()> {
        let content = toml::to_string_pretty(record)
            .map_err(|e| ChimneyError::ConfigError(format!("Failed to serialize profile: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ChimneyError::ConfigError(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        // Write next to the target and rename so a crash never leaves half a file
        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| ChimneyError::ConfigError(format!("Failed to write profile to {:?}: {}", tmp, e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(PROFILE_FILE_MODE);
            tokio::fs::set_permissions(&tmp, perms).await.map_err(|e| {
                ChimneyError::ConfigError(format!("Failed to set permissions on {:?}: {}", tmp, e))
            })?;
        }

        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            ChimneyError::ConfigError(format!("Failed to replace {:?}: {}", self.path, e))
        })?;

        debug!("Wrote profile record {} to {:?}", record.id, self.path);
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for FileProfileStore {
    async fn save(&self, profile: &ConnectionProfile) -> ChimneyResult<ProfileId> {
        let _guard = self.write_lock.lock().await;

        let id = self
            .read_record()
            .await?
            .map(|record| record.id)
            .unwrap_or(FIRST_PROFILE_ID);

        self.write_record(&ProfileRecord { id, profile: profile.clone() }).await?;
        info!("Saved connection profile {} to {:?}", id, self.path);
        Ok(id)
    }

    async fn load(&self) -> ChimneyResult<Option<ConnectionProfile>> {
        Ok(self.read_record().await?.map(|record| record.profile))
    }
}

/// Profile kept in memory, for embedding and tests
#[derive(Default)]
pub struct MemoryProfileStore {
    record: RwLock<Option<ProfileRecord>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryProfileStore {
    async fn save(&self, profile: &ConnectionProfile) -> ChimneyResult<ProfileId> {
        let mut record = self.record.write().await;
        let id = record.as_ref().map(|r| r.id).unwrap_or(FIRST_PROFILE_ID);
        *record = Some(ProfileRecord { id, profile: profile.clone() });
        Ok(id)
    }

    async fn load(&self) -> ChimneyResult<Option<ConnectionProfile>> {
        Ok(self.record.read().await.as_ref().map(|r| r.profile.clone()))
    }
}
