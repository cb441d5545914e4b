//! Local file-based state storage backend.
//!
//! This module provides a simple file-based state storage for local
//! development and single-runner pipelines.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{CirrusError, Result, StateError};

use super::backend::StateStorage;
use super::lock::{LOCK_ATTEMPTS, LOCK_EXPIRY_SECS, LockInfo, ensure_held};
use super::types::{STATE_VERSION, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".cirrus";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state storage.
#[derive(Debug)]
pub struct LocalStateStorage {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStorage {
    /// Creates a local storage under `.cirrus` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| CirrusError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a local storage with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                CirrusError::State(StateError::write(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a synced temp file and a rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let temp_path = path.with_extension(format!("{extension}.tmp"));
        let write_err = |e: std::io::Error| {
            CirrusError::State(StateError::write(format!(
                "Failed to write {}: {e}",
                temp_path.display()
            )))
        };

        let mut file = fs::File::create(&temp_path).await.map_err(write_err)?;
        file.write_all(content.as_bytes()).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        fs::rename(&temp_path, path).await.map_err(|e| {
            CirrusError::State(StateError::write(format!(
                "Failed to rename state file: {e}"
            )))
        })?;
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(&self.lock_path).await {
            Ok(content) => LockInfo::from_json(&content).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CirrusError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })),
        }
    }

    /// Publishes `lock` unless a lock file already exists.
    ///
    /// The content is written to a private file first and hard-linked into
    /// place, so readers never see a partial lock and only one runner wins.
    async fn link_lock_file(&self, lock: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;

        let staged = self.base_dir.join(format!("{LOCK_FILE}.{}", lock.lock_id));
        let lock_err = |e: std::io::Error| {
            CirrusError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        };

        fs::write(&staged, lock.to_json()?).await.map_err(lock_err)?;
        let linked = fs::hard_link(&staged, &self.lock_path).await;
        let _ = fs::remove_file(&staged).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(lock_err(e)),
        }
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CirrusError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl StateStorage for LocalStateStorage {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            CirrusError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let state: StateSnapshot = serde_json::from_str(&content).map_err(|e| {
            CirrusError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        if state.version != STATE_VERSION {
            return Err(CirrusError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }

        Ok(Some(state))
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        debug!(
            "Saving state serial {} to: {}",
            state.serial,
            self.state_path.display()
        );

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            CirrusError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        self.write_atomic(&self.state_path, &content).await
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                CirrusError::State(StateError::write(format!(
                    "Failed to delete state file: {e}"
                )))
            })?;
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::for_holder(holder);

        for _ in 0..LOCK_ATTEMPTS {
            if self.link_lock_file(&lock_info).await? {
                info!(
                    "Acquired state lock: {} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => return Err(existing.held_error()),
                Some(existing) => {
                    debug!("Lock {} of {} expired, taking over", existing.lock_id, existing.holder);
                    self.delete_lock_file().await?;
                }
                None => {}
            }
        }

        Err(CirrusError::State(StateError::LockFailed {
            message: format!("Lock file {} kept changing", self.lock_path.display()),
        }))
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock = ensure_held(self.read_lock_file().await?, lock_id)?;
        lock.extend();
        self.write_atomic(&self.lock_path, &lock.to_json()?).await?;
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        ensure_held(self.read_lock_file().await?, lock_id)?;
        self.delete_lock_file().await?;
        info!("Released state lock: {lock_id}");
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        info!("Force-removing state lock at {}", self.lock_path.display());
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
