//! In-memory document store
//!
//! One mutex guards the whole map, so a commit validates and applies its
//! writes without interleaving. Every write draws a fresh version from a
//! store-wide counter. Used in dev mode and by the test suite, which also
//! relies on the fault injection hooks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use super::store::{Collection, DocKey, DocumentStore, Snapshot, StoreError, VersionedDoc, WriteSet};

#[derive(Default)]
struct Inner {
    docs: HashMap<DocKey, VersionedDoc>,
    last_version: u64,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }
}

#[derive(Default)]
struct Faults {
    commits: VecDeque<StoreError>,
    appends: HashMap<Collection, VecDeque<StoreError>>,
    commit_latency: Option<Duration>,
}

/// Process-local [`DocumentStore`]
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    faults: Mutex<Faults>,
    commits: AtomicU64,
    conflicts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("Memory store lock poisoned".into()))
    }

    fn lock_faults(&self) -> Result<MutexGuard<'_, Faults>, StoreError> {
        self.faults
            .lock()
            .map_err(|_| StoreError::Backend("Memory store lock poisoned".into()))
    }

    /// Make the next `times` commits fail with `err` before touching data
    pub fn fail_next_commits(&self, err: StoreError, times: usize) -> Result<(), StoreError> {
        let mut faults = self.lock_faults()?;
        faults.commits.extend(std::iter::repeat(err).take(times));
        Ok(())
    }

    /// Make the next `times` appends to `collection` fail with `err`
    pub fn fail_next_appends(
        &self,
        collection: Collection,
        err: StoreError,
        times: usize,
    ) -> Result<(), StoreError> {
        let mut faults = self.lock_faults()?;
        faults
            .appends
            .entry(collection)
            .or_default()
            .extend(std::iter::repeat(err).take(times));
        Ok(())
    }

    /// Delay every commit, widening the window between snapshot and commit
    pub fn set_commit_latency(&self, latency: Option<Duration>) -> Result<(), StoreError> {
        self.lock_faults()?.commit_latency = latency;
        Ok(())
    }

    /// Write a document directly, outside any transaction
    pub fn seed<T: Serialize>(&self, key: &DocKey, doc: &T) -> Result<(), StoreError> {
        let body = serde_json::to_value(doc)?;
        let mut inner = self.lock_inner()?;
        let version = inner.next_version();
        inner.docs.insert(key.clone(), VersionedDoc { version, body });
        Ok(())
    }

    /// Decode a document directly
    pub fn read<T: DeserializeOwned>(&self, key: &DocKey) -> Result<Option<T>, StoreError> {
        let inner = self.lock_inner()?;
        inner
            .docs
            .get(key)
            .map(|doc| serde_json::from_value(doc.body.clone()))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Ids currently stored in `collection`, sorted
    pub fn ids(&self, collection: Collection) -> Result<Vec<String>, StoreError> {
        let inner = self.lock_inner()?;
        let mut ids: Vec<String> = inner
            .docs
            .keys()
            .filter(|k| k.collection == collection)
            .map(|k| k.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Successful commits so far
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Commits rejected for a stale snapshot so far
    pub fn conflict_count(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &DocKey) -> Result<Option<VersionedDoc>, StoreError> {
        Ok(self.lock_inner()?.docs.get(key).cloned())
    }

    async fn snapshot(&self, keys: &[DocKey]) -> Result<Snapshot, StoreError> {
        let inner = self.lock_inner()?;
        let mut snapshot = Snapshot::new();
        for key in keys {
            snapshot.insert(key.clone(), inner.docs.get(key).cloned());
        }
        Ok(snapshot)
    }

    async fn commit(&self, snapshot: &Snapshot, writes: WriteSet) -> Result<(), StoreError> {
        let (fault, latency) = {
            let mut faults = self.lock_faults()?;
            (faults.commits.pop_front(), faults.commit_latency)
        };
        if let Some(err) = fault {
            debug!(error = %err, "Injected commit failure");
            return Err(err);
        }
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock_inner()?;

        for key in snapshot.keys() {
            let current = inner.docs.get(key).map(|d| d.version);
            if current != snapshot.version(key) {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::Conflict {
                    key: key.to_string(),
                });
            }
        }

        if let Some((key, _)) = writes.iter().find(|(key, _)| !snapshot.covers(key)) {
            return Err(StoreError::Backend(format!(
                "Write to {} outside the read set",
                key
            )));
        }

        for (key, body) in writes.iter() {
            let version = inner.next_version();
            inner.docs.insert(
                key.clone(),
                VersionedDoc {
                    version,
                    body: body.clone(),
                },
            );
        }

        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn append(&self, collection: Collection, body: Value) -> Result<String, StoreError> {
        let fault = self
            .lock_faults()?
            .appends
            .get_mut(&collection)
            .and_then(VecDeque::pop_front);
        if let Some(err) = fault {
            debug!(error = %err, collection = %collection, "Injected append failure");
            return Err(err);
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut inner = self.lock_inner()?;
        let version = inner.next_version();
        inner
            .docs
            .insert(DocKey::new(collection, id.clone()), VersionedDoc { version, body });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_commit_applies_writes_atomically() {
        let store = MemoryStore::new();
        let a = DocKey::account("a");
        let b = DocKey::account("b");

        let snapshot = store.snapshot(&[a.clone(), b.clone()]).await.unwrap();
        let mut writes = WriteSet::new();
        writes.put(a.clone(), &json!({ "n": 1 })).unwrap();
        writes.put(b.clone(), &json!({ "n": 2 })).unwrap();
        store.commit(&snapshot, writes).await.unwrap();

        assert_eq!(store.ids(Collection::Accounts).unwrap(), vec!["a", "b"]);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_absent_key_created_concurrently_conflicts() {
        let store = MemoryStore::new();
        let key = DocKey::email_claim("a@example.com");
        let snapshot = store.snapshot(&[key.clone()]).await.unwrap();

        store.seed(&key, &json!({ "owner": "other" })).unwrap();

        let mut writes = WriteSet::new();
        writes.put(key.clone(), &json!({ "owner": "me" })).unwrap();
        assert!(matches!(
            store.commit(&snapshot, writes).await,
            Err(StoreError::Conflict { .. })
        ));
        assert_eq!(store.conflict_count(), 1);

        let owner: Value = store.read(&key).unwrap().unwrap();
        assert_eq!(owner["owner"], "other");
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let store = MemoryStore::new();
        store
            .fail_next_commits(StoreError::Unauthenticated, 1)
            .unwrap();
        store
            .fail_next_appends(Collection::Sessions, StoreError::Unavailable("down".into()), 1)
            .unwrap();

        let snapshot = store.snapshot(&[]).await.unwrap();
        assert_eq!(
            store.commit(&snapshot, WriteSet::new()).await,
            Err(StoreError::Unauthenticated)
        );
        assert!(store.commit(&snapshot, WriteSet::new()).await.is_ok());

        assert!(store.append(Collection::Sessions, json!({})).await.is_err());
        let id = store.append(Collection::Sessions, json!({})).await.unwrap();
        assert!(store.get(&DocKey::new(Collection::Sessions, id)).await.unwrap().is_some());
    }
}
