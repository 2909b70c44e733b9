//! MongoDB document store
//!
//! Each logical collection maps to a MongoDB collection of envelopes
//! `{ _id, version, body, updated_at }`. Snapshots are read inside a
//! snapshot-read-concern transaction; commits run in a multi-document
//! transaction whose updates are guarded on the version each key had in the
//! snapshot. Requires a replica set (transactions).

use bson::{doc, Bson, Document};
use mongodb::{
    error::{Error as MongoError, ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    options::{IndexOptions, ReadConcern, TransactionOptions, WriteConcern},
    Client, ClientSession, Collection as MongoCollection, IndexModel,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::store::{Collection, DocKey, DocumentStore, Snapshot, StoreError, VersionedDoc, WriteSet};
use crate::types::CarelinkError;

/// Attempts at committing when the server cannot tell whether a commit landed
const COMMIT_RESULT_RETRIES: u32 = 3;

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and ping
    pub async fn new(uri: &str, db_name: &str) -> Result<Self, CarelinkError> {
        info!("Connecting to MongoDB");

        // Fail fast instead of hanging on an unreachable server
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri).await.map_err(|e| {
            CarelinkError::StoreUnavailable(format!("Failed to connect to MongoDB: {}", e))
        })?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| CarelinkError::StoreUnavailable(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// Stored form of every document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "_id")]
    id: String,
    version: i64,
    body: Bson,
    updated_at: bson::DateTime,
}

/// Secondary indexes per collection.
///
/// The unique index on account emails backs up the claim ledger: a second
/// account for an address fails its insert and is retried as a conflict.
fn indexes_for(collection: Collection) -> Vec<(Document, Option<IndexOptions>)> {
    match collection {
        Collection::Accounts => vec![(
            doc! { "body.normalized_email": 1 },
            Some(IndexOptions::builder().unique(true).build()),
        )],
        Collection::LinkingCodes => vec![(doc! { "body.owner_account_id": 1 }, None)],
        Collection::Assignments => vec![(doc! { "body.dependent_account_id": 1 }, None)],
        Collection::Sessions => vec![(doc! { "body.assignment_id": 1 }, None)],
        Collection::Rosters => vec![(doc! { "body.manager_account_id": 1 }, None)],
        Collection::EmailClaims | Collection::AuditLog => Vec::new(),
    }
}

/// [`DocumentStore`] backed by MongoDB
#[derive(Clone)]
pub struct MongoStore {
    client: MongoClient,
}

impl MongoStore {
    /// Wrap a connected client and apply indexes
    pub async fn new(client: MongoClient) -> Result<Self, CarelinkError> {
        let store = Self { client };
        store.apply_indexes().await?;
        Ok(store)
    }

    async fn apply_indexes(&self) -> Result<(), CarelinkError> {
        for collection in Collection::ALL {
            let indices: Vec<IndexModel> = indexes_for(collection)
                .into_iter()
                .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
                .collect();

            if indices.is_empty() {
                continue;
            }

            self.collection(collection)
                .create_indexes(indices)
                .await
                .map_err(|e| {
                    CarelinkError::StoreUnavailable(format!(
                        "Failed to create indexes on {}: {}",
                        collection, e
                    ))
                })?;
        }
        Ok(())
    }

    fn collection(&self, collection: Collection) -> MongoCollection<Envelope> {
        self.client
            .inner()
            .database(self.client.db_name())
            .collection::<Envelope>(collection.as_str())
    }

    async fn begin(&self, options: TransactionOptions) -> Result<ClientSession, StoreError> {
        let mut session = self
            .client
            .inner()
            .start_session()
            .await
            .map_err(|e| classify(e, None))?;
        session
            .start_transaction()
            .with_options(options)
            .await
            .map_err(|e| classify(e, None))?;
        Ok(session)
    }

    async fn read_in(
        &self,
        session: &mut ClientSession,
        key: &DocKey,
    ) -> Result<Option<VersionedDoc>, StoreError> {
        let envelope = self
            .collection(key.collection)
            .find_one(doc! { "_id": &key.id })
            .session(&mut *session)
            .await
            .map_err(|e| classify(e, Some(key)))?;
        envelope.map(into_versioned).transpose()
    }

    async fn write_in(
        &self,
        session: &mut ClientSession,
        key: &DocKey,
        expected: Option<u64>,
        body: &Value,
    ) -> Result<(), StoreError> {
        let body = to_bson_body(body)?;
        let now = bson::DateTime::now();

        match expected {
            None => {
                let envelope = Envelope {
                    id: key.id.clone(),
                    version: 1,
                    body,
                    updated_at: now,
                };
                self.collection(key.collection)
                    .insert_one(envelope)
                    .session(&mut *session)
                    .await
                    .map_err(|e| classify(e, Some(key)))?;
            }
            Some(version) => {
                let version = version_to_i64(version)?;
                let result = self
                    .collection(key.collection)
                    .update_one(
                        doc! { "_id": &key.id, "version": version },
                        doc! { "$set": { "body": body, "version": version + 1, "updated_at": now } },
                    )
                    .session(&mut *session)
                    .await
                    .map_err(|e| classify(e, Some(key)))?;
                if result.matched_count == 0 {
                    return Err(StoreError::Conflict {
                        key: key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Pin a key that was read but not written so concurrent writers conflict
    async fn fence_in(
        &self,
        session: &mut ClientSession,
        key: &DocKey,
        expected: Option<u64>,
    ) -> Result<(), StoreError> {
        match expected {
            Some(version) => {
                let version = version_to_i64(version)?;
                let result = self
                    .collection(key.collection)
                    .update_one(
                        doc! { "_id": &key.id, "version": version },
                        doc! { "$set": { "fenced_at": bson::DateTime::now() } },
                    )
                    .session(&mut *session)
                    .await
                    .map_err(|e| classify(e, Some(key)))?;
                if result.matched_count == 0 {
                    return Err(StoreError::Conflict {
                        key: key.to_string(),
                    });
                }
            }
            None => {
                if self.read_in(session, key).await?.is_some() {
                    return Err(StoreError::Conflict {
                        key: key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn finish(&self, session: &mut ClientSession) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match session.commit_transaction().await {
                Ok(()) => return Ok(()),
                Err(e)
                    if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                        && attempt < COMMIT_RESULT_RETRIES =>
                {
                    debug!(attempt, "Commit result unknown, retrying commit");
                }
                Err(e) => return Err(classify(e, None)),
            }
        }
    }

    async fn apply(
        &self,
        session: &mut ClientSession,
        snapshot: &Snapshot,
        writes: &WriteSet,
    ) -> Result<(), StoreError> {
        for key in snapshot.keys() {
            let expected = snapshot.version(key);
            match writes.get(key) {
                Some(body) => self.write_in(session, key, expected, body).await?,
                None => self.fence_in(session, key, expected).await?,
            }
        }
        self.finish(session).await
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn get(&self, key: &DocKey) -> Result<Option<VersionedDoc>, StoreError> {
        let envelope = self
            .collection(key.collection)
            .find_one(doc! { "_id": &key.id })
            .await
            .map_err(|e| classify(e, Some(key)))?;
        envelope.map(into_versioned).transpose()
    }

    async fn snapshot(&self, keys: &[DocKey]) -> Result<Snapshot, StoreError> {
        let options = TransactionOptions::builder()
            .read_concern(ReadConcern::snapshot())
            .build();
        let mut session = self.begin(options).await?;

        let mut snapshot = Snapshot::new();
        for key in keys {
            let doc = self.read_in(&mut session, key).await?;
            snapshot.insert(key.clone(), doc);
        }

        self.finish(&mut session).await?;
        Ok(snapshot)
    }

    async fn commit(&self, snapshot: &Snapshot, writes: WriteSet) -> Result<(), StoreError> {
        if let Some((key, _)) = writes.iter().find(|(key, _)| !snapshot.covers(key)) {
            return Err(StoreError::Backend(format!(
                "Write to {} outside the read set",
                key
            )));
        }

        let options = TransactionOptions::builder()
            .read_concern(ReadConcern::snapshot())
            .write_concern(WriteConcern::majority())
            .build();
        let mut session = self.begin(options).await?;

        let result = self.apply(&mut session, snapshot, &writes).await;
        if result.is_err() {
            // Best effort; the server aborts abandoned transactions on its own
            let _ = session.abort_transaction().await;
        }
        result
    }

    async fn append(&self, collection: Collection, body: Value) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let envelope = Envelope {
            id: id.clone(),
            version: 1,
            body: to_bson_body(&body)?,
            updated_at: bson::DateTime::now(),
        };
        self.collection(collection)
            .insert_one(envelope)
            .await
            .map_err(|e| classify(e, Some(&DocKey::new(collection, id.clone()))))?;
        Ok(id)
    }
}

fn into_versioned(envelope: Envelope) -> Result<VersionedDoc, StoreError> {
    let version = u64::try_from(envelope.version)
        .map_err(|_| StoreError::Serialization(format!("Negative version on {}", envelope.id)))?;
    Ok(VersionedDoc {
        version,
        body: from_bson_body(envelope.body)?,
    })
}

fn version_to_i64(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Serialization("Version overflow".into()))
}

fn to_bson_body(body: &Value) -> Result<Bson, StoreError> {
    bson::to_bson(body).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_bson_body(body: Bson) -> Result<Value, StoreError> {
    bson::from_bson(body).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Map a server error code onto a store error kind
fn classify_code(code: i32, key: Option<&DocKey>) -> Option<StoreError> {
    let key = key.map(|k| k.to_string()).unwrap_or_default();
    match code {
        // Unauthorized
        13 => Some(StoreError::PermissionDenied { key }),
        // AuthenticationFailed
        18 => Some(StoreError::Unauthenticated),
        // WriteConflict, DuplicateKey
        112 | 11000 => Some(StoreError::Conflict { key }),
        _ => None,
    }
}

fn classify(err: MongoError, key: Option<&DocKey>) -> StoreError {
    if err.contains_label(TRANSIENT_TRANSACTION_ERROR) {
        return StoreError::Conflict {
            key: key.map(|k| k.to_string()).unwrap_or_default(),
        };
    }

    let classified = match err.kind.as_ref() {
        ErrorKind::Command(command) => classify_code(command.code, key),
        ErrorKind::Write(WriteFailure::WriteError(write)) => classify_code(write.code, key),
        ErrorKind::Authentication { .. } => Some(StoreError::Unauthenticated),
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => Some(StoreError::Unavailable(err.to_string())),
        _ => None,
    };

    classified.unwrap_or_else(|| StoreError::Backend(err.to_string()))
}

#[cfg(test)]
mod tests {
    // Transaction paths need a running replica set; only pure helpers are covered here
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_code() {
        let key = DocKey::email_claim("a@example.com");
        assert_eq!(
            classify_code(13, Some(&key)),
            Some(StoreError::PermissionDenied {
                key: "emailClaims/a@example.com".into()
            })
        );
        assert_eq!(classify_code(18, None), Some(StoreError::Unauthenticated));
        assert!(matches!(
            classify_code(11000, Some(&key)),
            Some(StoreError::Conflict { .. })
        ));
        assert!(matches!(classify_code(112, None), Some(StoreError::Conflict { .. })));
        assert_eq!(classify_code(2, None), None);
    }

    #[test]
    fn test_body_survives_bson() {
        let body = json!({
            "owner_account_id": "acct-1",
            "claimed_at": "2026-03-01T12:00:00Z",
            "nested": { "used": false, "attempts": 2 }
        });
        let back = from_bson_body(to_bson_body(&body).unwrap()).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn test_account_email_index_is_unique() {
        let indexes = indexes_for(Collection::Accounts);
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].1.as_ref().and_then(|o| o.unique), Some(true));
        assert!(indexes_for(Collection::EmailClaims).is_empty());
    }
}
