//! Document storage
//!
//! [`DocumentStore`] is the only way the engine touches persisted state.
//! [`MemoryStore`] backs dev mode and tests; [`MongoStore`] backs production.

mod memory;
mod mongo;
pub mod schemas;
mod store;

pub use memory::MemoryStore;
pub use mongo::{MongoClient, MongoStore};
pub use store::{
    transact, Collection, DocKey, DocumentStore, Snapshot, StoreError, TxnStep, VersionedDoc,
    WriteSet, MAX_TXN_KEYS,
};
