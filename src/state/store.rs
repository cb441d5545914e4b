//! Identity-keyed state store.
//!
//! [`StateStore`] is the object the differ and executor share. It keeps the
//! current [`StateSnapshot`] in memory, guards each write with an optimistic
//! fingerprint check, and persists every change through a [`StateStorage`]
//! backend before returning.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::ResourceId;
use crate::error::{ConflictError, CirrusError, Result, StateError};

use super::backend::StateStorage;
use super::types::{HistoryEntry, StateRecord, StateSnapshot};

/// Placeholder fingerprint used in conflicts for a missing record.
const ABSENT: &str = "<absent>";

/// What the caller expects to find before a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition<'a> {
    /// No check; last write wins.
    Any,
    /// No record may exist.
    Absent,
    /// A record with this fingerprint must exist and still verify.
    Fingerprint(&'a str),
}

/// Identity-keyed store over a durable backend.
pub struct StateStore {
    storage: Arc<dyn StateStorage>,
    snapshot: Mutex<StateSnapshot>,
    identity_locks: Mutex<HashMap<ResourceId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.storage.backend_type())
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Opens the store, loading the existing snapshot or starting an empty one.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or holds corrupt state.
    pub async fn open(
        storage: Arc<dyn StateStorage>,
        project: &str,
        environment: &str,
    ) -> Result<Self> {
        let snapshot = match storage.load().await? {
            Some(snapshot) => {
                if snapshot.project != project || snapshot.environment != environment {
                    warn!(
                        "State belongs to {}/{}, opened as {project}/{environment}",
                        snapshot.project, snapshot.environment
                    );
                }
                debug!(
                    "Opened state serial {} with {} records",
                    snapshot.serial,
                    snapshot.records.len()
                );
                snapshot
            }
            None => {
                info!("No existing state for {project}/{environment}, starting fresh");
                StateSnapshot::new(project, environment)
            }
        };

        Ok(Self {
            storage,
            snapshot: Mutex::new(snapshot),
            identity_locks: Mutex::new(HashMap::new()),
        })
    }

    /// The backend this store persists through.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StateStorage> {
        &self.storage
    }

    /// Gets the record for an identity.
    pub async fn get(&self, id: &ResourceId) -> Option<StateRecord> {
        self.snapshot.lock().await.get(id).cloned()
    }

    /// All records, ordered by identity.
    pub async fn records(&self) -> Vec<StateRecord> {
        self.snapshot.lock().await.records.values().cloned().collect()
    }

    /// A copy of the whole snapshot.
    pub async fn snapshot(&self) -> StateSnapshot {
        self.snapshot.lock().await.clone()
    }

    /// Current snapshot serial.
    pub async fn serial(&self) -> u64 {
        self.snapshot.lock().await.serial
    }

    /// Takes the per-identity lock. Hold it across check, provider call and
    /// commit so two branches never race on the same record.
    pub async fn lock_identity(&self, id: &ResourceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.identity_locks.lock().await;
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Checks a precondition without writing.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if the stored record does not match.
    pub async fn check(&self, id: &ResourceId, precondition: Precondition<'_>) -> Result<()> {
        let snapshot = self.snapshot.lock().await;
        check_record(id, snapshot.get(id), precondition)
    }

    /// Writes a record after checking the precondition, and persists it.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if the precondition fails, or a state error
    /// if persisting fails. In both cases the store is unchanged.
    pub async fn put(&self, mut record: StateRecord, precondition: Precondition<'_>) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        check_record(&record.id, snapshot.get(&record.id), precondition)?;

        if let Some(previous) = snapshot.get(&record.id) {
            record.created_at = previous.created_at;
        }
        record.fingerprint = record.compute_fingerprint();

        let mut next = snapshot.clone();
        debug!("Committing {} ({})", record.id, record.provider_id);
        next.records.insert(record.id.clone(), record);
        self.persist(&mut next).await?;
        *snapshot = next;
        Ok(())
    }

    /// Deletes a record after checking the precondition, and persists it.
    ///
    /// Returns the removed record, if there was one.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if the precondition fails, or a state error
    /// if persisting fails.
    pub async fn delete(
        &self,
        id: &ResourceId,
        precondition: Precondition<'_>,
    ) -> Result<Option<StateRecord>> {
        let mut snapshot = self.snapshot.lock().await;
        check_record(id, snapshot.get(id), precondition)?;

        if snapshot.get(id).is_none() {
            return Ok(None);
        }

        let mut next = snapshot.clone();
        let removed = next.records.remove(id);
        debug!("Removing {id} from state");
        self.persist(&mut next).await?;
        *snapshot = next;
        Ok(removed)
    }

    /// Appends a history entry; a successful entry also becomes the
    /// snapshot's config hash.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub async fn record_history(&self, entry: HistoryEntry) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        let mut next = snapshot.clone();
        if entry.success {
            next.config_hash.clone_from(&entry.config_hash);
        }
        next.add_history(entry);
        self.persist(&mut next).await?;
        *snapshot = next;
        Ok(())
    }

    /// Rereads the snapshot from the backend.
    ///
    /// When the backend holds nothing the in-memory snapshot is kept, so a
    /// store that never saved keeps its lineage.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub async fn reload(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        match self.storage.load().await? {
            Some(loaded) => *snapshot = loaded,
            None if snapshot.serial == 0 => {
                debug!("No saved state yet, keeping lineage {}", snapshot.lineage);
            }
            None => {
                warn!("Saved state disappeared, starting fresh");
                *snapshot = StateSnapshot::new(&snapshot.project, &snapshot.environment);
            }
        }
        Ok(())
    }

    async fn persist(&self, next: &mut StateSnapshot) -> Result<()> {
        next.serial += 1;
        next.last_updated = Utc::now();
        self.storage.save(next).await.map_err(|e| match e {
            CirrusError::State(_) => e,
            other => CirrusError::State(StateError::write(other.to_string())),
        })
    }
}

fn check_record(
    id: &ResourceId,
    current: Option<&StateRecord>,
    precondition: Precondition<'_>,
) -> Result<()> {
    let mismatch = |expected: &str, found: &str| {
        Err(CirrusError::Conflict(ConflictError::FingerprintMismatch {
            resource: id.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }))
    };

    match (precondition, current) {
        (Precondition::Any, _) | (Precondition::Absent, None) => Ok(()),
        (Precondition::Absent, Some(record)) => mismatch(ABSENT, &record.fingerprint),
        (Precondition::Fingerprint(expected), None) => mismatch(expected, ABSENT),
        (Precondition::Fingerprint(expected), Some(record)) => {
            if record.fingerprint != expected {
                return mismatch(expected, &record.fingerprint);
            }
            if !record.verify() {
                return mismatch(expected, &record.compute_fingerprint());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Attributes;
    use crate::state::LocalStateStorage;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn web() -> ResourceId {
        ResourceId::new("aws", "instance", "web")
    }

    fn record(provider_id: &str) -> StateRecord {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("ami"), json!("ami-1"));
        StateRecord::new(web(), provider_id, attributes, Attributes::new(), Vec::new())
    }

    async fn open(dir: &TempDir) -> StateStore {
        let storage = Arc::new(LocalStateStorage::with_base_dir(dir.path()));
        StateStore::open(storage, "proj", "dev")
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let store = open(&dir).await;
        store
            .put(record("i-1"), Precondition::Absent)
            .await
            .expect("put");
        let serial = store.serial().await;
        drop(store);

        let reopened = open(&dir).await;
        let loaded = reopened.get(&web()).await.expect("record survives");
        assert_eq!(loaded.provider_id, "i-1");
        assert!(loaded.verify());
        assert_eq!(reopened.serial().await, serial);
    }

    #[tokio::test]
    async fn test_put_rejects_stale_fingerprint() {
        let dir = TempDir::new().expect("temp dir");
        let store = open(&dir).await;
        let first = record("i-1");
        let stale = first.fingerprint.clone();
        assert_ok!(store.put(first, Precondition::Absent).await);
        assert_ok!(store.put(record("i-2"), Precondition::Fingerprint(&stale)).await);

        let err = assert_err!(
            store
                .put(record("i-3"), Precondition::Fingerprint(&stale))
                .await
        );
        assert!(matches!(err, CirrusError::Conflict(_)));
        assert_eq!(
            store.get(&web()).await.map(|r| r.provider_id).as_deref(),
            Some("i-2")
        );
    }

    #[tokio::test]
    async fn test_absent_precondition_conflicts_with_existing() {
        let dir = TempDir::new().expect("temp dir");
        let store = open(&dir).await;
        store.put(record("i-1"), Precondition::Any).await.expect("put");

        let result = store.check(&web(), Precondition::Absent).await;
        assert!(result.is_err_and(|e| e.resource() == Some("aws.instance.web")));
    }

    #[tokio::test]
    async fn test_delete_persists_and_bumps_serial() {
        let dir = TempDir::new().expect("temp dir");
        let store = open(&dir).await;
        let rec = record("i-1");
        let fingerprint = rec.fingerprint.clone();
        store.put(rec, Precondition::Absent).await.expect("put");
        let before = store.serial().await;

        let removed = store
            .delete(&web(), Precondition::Fingerprint(&fingerprint))
            .await
            .expect("delete");
        assert!(removed.is_some());
        assert_eq!(store.serial().await, before + 1);

        let reopened = open(&dir).await;
        assert!(reopened.get(&web()).await.is_none());
    }

    #[tokio::test]
    async fn test_reload_of_unsaved_store_keeps_lineage() {
        let dir = TempDir::new().expect("temp dir");
        let store = open(&dir).await;
        let lineage = store.snapshot().await.lineage;

        store.reload().await.expect("reload");
        assert_eq!(store.snapshot().await.lineage, lineage);

        store.put(record("i-1"), Precondition::Absent).await.expect("put");
        store.reload().await.expect("reload");
        assert_eq!(store.snapshot().await.lineage, lineage);
        assert!(store.get(&web()).await.is_some());
    }

    #[tokio::test]
    async fn test_tampered_record_fails_verification() {
        let dir = TempDir::new().expect("temp dir");
        let mut rec = record("i-1");
        let fingerprint = rec.fingerprint.clone();
        rec.provider_id = String::from("i-evil");

        let mut snapshot = StateSnapshot::new("proj", "dev");
        snapshot.records.insert(web(), rec);
        LocalStateStorage::with_base_dir(dir.path())
            .save(&snapshot)
            .await
            .expect("seed state");

        let store = open(&dir).await;
        let err = assert_err!(
            store
                .check(&web(), Precondition::Fingerprint(&fingerprint))
                .await
        );
        assert!(matches!(err, CirrusError::Conflict(_)));
    }
}
