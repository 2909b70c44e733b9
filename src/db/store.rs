//! Document store abstraction
//!
//! Every backend offers point reads, versioned snapshots over a bounded key
//! set, version-checked commits and appends. [`transact`] builds the
//! read-decide-write transaction on top of those primitives; retrying a
//! conflicted transaction is the caller's job (see `services::retry`).

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Most keys a single transaction may read
pub const MAX_TXN_KEYS: usize = 16;

/// Errors raised by a document store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A key in the read set changed before commit
    #[error("Write conflict on {key}")]
    Conflict { key: String },

    #[error("Permission denied on {key}")]
    PermissionDenied { key: String },

    /// The caller's credential was not accepted
    #[error("Caller is not authenticated")]
    Unauthenticated,

    #[error("Document not found: {key}")]
    NotFound { key: String },

    /// Transient network or availability failure
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the operation may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::PermissionDenied { .. }
                | Self::Unauthenticated
                | Self::Unavailable(_)
        )
    }

    /// Whether the caller's credential should be refreshed before retrying
    pub fn needs_credential_refresh(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. } | Self::Unauthenticated)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Logical collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Accounts,
    EmailClaims,
    LinkingCodes,
    Assignments,
    Sessions,
    Rosters,
    AuditLog,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Accounts,
        Collection::EmailClaims,
        Collection::LinkingCodes,
        Collection::Assignments,
        Collection::Sessions,
        Collection::Rosters,
        Collection::AuditLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::EmailClaims => "emailClaims",
            Self::LinkingCodes => "linkingCodes",
            Self::Assignments => "assignments",
            Self::Sessions => "sessions",
            Self::Rosters => "rosters",
            Self::AuditLog => "auditLog",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    pub collection: Collection,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
        }
    }

    pub fn account(account_id: &str) -> Self {
        Self::new(Collection::Accounts, account_id)
    }

    pub fn email_claim(normalized_email: &str) -> Self {
        Self::new(Collection::EmailClaims, normalized_email)
    }

    pub fn linking_code(digest: &str) -> Self {
        Self::new(Collection::LinkingCodes, digest)
    }

    pub fn assignment(assignment_id: &str) -> Self {
        Self::new(Collection::Assignments, assignment_id)
    }

    pub fn roster(manager_account_id: &str, dependent_account_id: &str) -> Self {
        Self::new(
            Collection::Rosters,
            crate::db::schemas::roster_entry_id(manager_account_id, dependent_account_id),
        )
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A stored document and its version stamp
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDoc {
    pub version: u64,
    pub body: Value,
}

/// Mutually consistent view of a set of keys.
///
/// Absent documents are recorded too: committing against a snapshot fails if
/// a key that was absent has since been created.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<DocKey, Option<VersionedDoc>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what the store holds for `key`
    pub fn insert(&mut self, key: DocKey, doc: Option<VersionedDoc>) {
        self.entries.insert(key, doc);
    }

    pub fn covers(&self, key: &DocKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn exists(&self, key: &DocKey) -> bool {
        matches!(self.entries.get(key), Some(Some(_)))
    }

    /// Version seen for `key`; `None` if absent or not read
    pub fn version(&self, key: &DocKey) -> Option<u64> {
        self.entries.get(key).and_then(|d| d.as_ref()).map(|d| d.version)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode the document at `key`
    pub fn decode<T: DeserializeOwned>(&self, key: &DocKey) -> Result<Option<T>, StoreError> {
        match self.entries.get(key) {
            None => Err(StoreError::Backend(format!("{} is not in the read set", key))),
            Some(None) => Ok(None),
            Some(Some(doc)) => Ok(Some(serde_json::from_value(doc.body.clone())?)),
        }
    }
}

/// Writes applied atomically by a commit
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    puts: BTreeMap<DocKey, Value>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace (or create) the document at `key`
    pub fn put<T: Serialize>(&mut self, key: DocKey, doc: &T) -> Result<&mut Self, StoreError> {
        self.puts.insert(key, serde_json::to_value(doc)?);
        Ok(self)
    }

    pub fn get(&self, key: &DocKey) -> Option<&Value> {
        self.puts.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DocKey, &Value)> {
        self.puts.iter()
    }

    pub fn len(&self) -> usize {
        self.puts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty()
    }
}

/// Storage backend
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read
    async fn get(&self, key: &DocKey) -> Result<Option<VersionedDoc>, StoreError>;

    /// Read `keys` as one consistent snapshot
    async fn snapshot(&self, keys: &[DocKey]) -> Result<Snapshot, StoreError>;

    /// Apply `writes` if no key in `snapshot` changed since it was read.
    ///
    /// Every written key must be part of the snapshot. Fails with
    /// [`StoreError::Conflict`] without applying anything otherwise.
    async fn commit(&self, snapshot: &Snapshot, writes: WriteSet) -> Result<(), StoreError>;

    /// Append a new document under a store-generated id
    async fn append(&self, collection: Collection, body: Value) -> Result<String, StoreError>;
}

/// Outcome of a transaction's decision function
pub enum TxnStep<T> {
    /// Commit these writes and return the value
    Commit(WriteSet, T),
    /// Write nothing; the reads are still validated before returning
    Abort(T),
    /// Re-run with these additional keys in the read set
    Expand(Vec<DocKey>),
}

/// One optimistic read-decide-write transaction.
///
/// `decide` sees a snapshot of `read_keys` and may ask for more keys when the
/// decision depends on something it just read (the owner of a claim, say).
/// Conflicts surface as [`StoreError::Conflict`]; the caller retries.
pub async fn transact<T, F>(
    store: &dyn DocumentStore,
    read_keys: &[DocKey],
    mut decide: F,
) -> Result<T, StoreError>
where
    F: FnMut(&Snapshot) -> Result<TxnStep<T>, StoreError>,
{
    let mut keys: Vec<DocKey> = Vec::with_capacity(read_keys.len());
    for key in read_keys {
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }

    loop {
        if keys.len() > MAX_TXN_KEYS {
            return Err(StoreError::Backend(format!(
                "Transaction read set exceeds {} keys",
                MAX_TXN_KEYS
            )));
        }

        let snapshot = store.snapshot(&keys).await?;

        match decide(&snapshot)? {
            TxnStep::Commit(writes, value) => {
                if let Some((key, _)) = writes.iter().find(|(key, _)| !snapshot.covers(key)) {
                    return Err(StoreError::Backend(format!(
                        "Write to {} outside the read set",
                        key
                    )));
                }
                store.commit(&snapshot, writes).await?;
                return Ok(value);
            }
            TxnStep::Abort(value) => {
                store.commit(&snapshot, WriteSet::new()).await?;
                return Ok(value);
            }
            TxnStep::Expand(extra) => {
                let before = keys.len();
                for key in extra {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                if keys.len() == before {
                    return Err(StoreError::Backend(
                        "Transaction expansion requested no new keys".into(),
                    ));
                }
            }
        }
    }
}
