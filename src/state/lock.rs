//! Advisory whole-state locking.
//!
//! `apply` and `destroy` hold the backend lock for their whole duration so
//! two runners never apply against the same state. Locks expire after
//! [`LOCK_EXPIRY_SECS`] so a crashed runner cannot wedge the state forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::backend::StateStorage;
use crate::error::{CirrusError, Result, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// How often a held lock is renewed.
const LOCK_RENEW_SECS: u64 = 100;

/// Publish attempts per acquire; one more than needed to clear an expired lock.
pub const LOCK_ATTEMPTS: usize = 2;

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Creates a lock for `holder`, or for a generated holder id when empty.
    #[must_use]
    pub fn for_holder(holder: &str) -> Self {
        if holder.is_empty() {
            Self::new(&generate_holder_id())
        } else {
            Self::new(holder)
        }
    }

    /// Serializes the lock as stored by the backends.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            CirrusError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })
    }

    /// Parses a stored lock.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if `content` is not a lock.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| {
            CirrusError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })
    }

    /// The error reported to a runner that finds this lock held.
    #[must_use]
    pub fn held_error(&self) -> CirrusError {
        CirrusError::State(StateError::LockedByOther {
            holder: self.holder.clone(),
            since: self.acquired_at.to_rfc3339(),
        })
    }

    /// Moves the expiry a full lock period past now.
    pub fn extend(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

/// Returns the current lock if it is `lock_id`, else a `LockLost` error.
///
/// # Errors
///
/// Returns `LockLost` when the lock is missing or held under another id.
pub fn ensure_held(current: Option<LockInfo>, lock_id: &str) -> Result<LockInfo> {
    match current {
        Some(lock) if lock.lock_id == lock_id => Ok(lock),
        other => Err(CirrusError::State(StateError::LockLost {
            lock_id: lock_id.to_string(),
            holder: other.map_or_else(|| String::from("none"), |lock| lock.holder),
        })),
    }
}

/// Runs `work` while holding the storage lock, renewing it until `work`
/// finishes.
///
/// The lock is released whether `work` succeeds or fails. A release that
/// finds the lock taken over turns a successful result into `LockLost`;
/// other release failures are logged.
///
/// # Errors
///
/// Returns an error if the lock is held by someone else, the error of
/// `work` itself, or `LockLost`.
pub async fn with_state_lock<S, F, Fut, T>(storage: &S, work: F) -> Result<T>
where
    S: StateStorage + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    hold_state_lock(storage, Duration::from_secs(LOCK_RENEW_SECS), work).await
}

async fn hold_state_lock<S, F, Fut, T>(storage: &S, renew_every: Duration, work: F) -> Result<T>
where
    S: StateStorage + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lock = storage.acquire_lock(&generate_holder_id()).await?;
    let work = work();
    tokio::pin!(work);
    let mut renew =
        tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);

    let result = loop {
        tokio::select! {
            result = &mut work => break result,
            _ = renew.tick() => match storage.renew_lock(&lock.lock_id).await {
                Ok(renewed) => debug!("Renewed state lock {} until {}", renewed.lock_id, renewed.expires_at),
                Err(e) => error!("Failed to renew state lock {}: {e}", lock.lock_id),
            },
        }
    };

    match storage.release_lock(&lock.lock_id).await {
        Ok(()) => result,
        Err(e @ CirrusError::State(StateError::LockLost { .. })) => {
            error!("{e}; state may have been written by another runner");
            result.and(Err(e))
        }
        Err(e) => {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
            result
        }
    }
}
