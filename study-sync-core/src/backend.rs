//! In-process document service.
//!
//! [`MemoryBackend`] stores documents in memory and can be switched offline,
//! made to reject writes, or told to hold writes until released. It backs
//! local-only demos and the engine's tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{RemoteError, RemoteResult};
use crate::record::SubjectId;
use crate::remote::{BatchWrite, Document, DocumentBackend, Identity};

type CollectionKey = (String, String);

/// A call observed by the backend, recorded once it settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// A collection was listed.
    List {
        /// Owner uid.
        uid: String,
        /// Collection name.
        collection: String,
    },
    /// A single document was upserted.
    Set {
        /// Owner uid.
        uid: String,
        /// Collection name.
        collection: String,
        /// Document id.
        id: SubjectId,
    },
    /// A single document was deleted.
    Delete {
        /// Owner uid.
        uid: String,
        /// Collection name.
        collection: String,
        /// Document id.
        id: SubjectId,
    },
    /// A batch was committed.
    Commit {
        /// Owner uid.
        uid: String,
        /// Collection name.
        collection: String,
        /// Number of writes in the batch.
        writes: usize,
    },
}

/// Document service held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    collections: Mutex<HashMap<CollectionKey, BTreeMap<SubjectId, Value>>>,
    calls: Mutex<Vec<BackendCall>>,
    offline: AtomicBool,
    fail_writes: AtomicBool,
    held: AtomicBool,
    gate: Notify,
}

impl MemoryBackend {
    /// Create an empty, online backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make every write fail with a rejected status.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Hold every write until [`MemoryBackend::release_writes`] is called.
    pub fn hold_writes(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let held and future writes proceed.
    pub fn release_writes(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    /// Seed a document directly, bypassing the call log.
    pub fn insert(&self, uid: &str, collection: &str, id: &str, data: Value) {
        let mut collections = self
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        collections
            .entry((uid.to_string(), collection.to_string()))
            .or_default()
            .insert(id.to_string(), data);
    }

    /// Snapshot of the documents stored for `uid` in `collection`.
    #[must_use]
    pub fn documents(&self, uid: &str, collection: &str) -> BTreeMap<SubjectId, Value> {
        let collections = self
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        collections
            .get(&(uid.to_string(), collection.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Every settled call, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of settled calls that wrote or deleted documents.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| !matches!(call, BackendCall::List { .. }))
            .count()
    }

    fn check_online(&self) -> RemoteResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RemoteError::Unavailable("memory backend is offline".into()))
        } else {
            Ok(())
        }
    }

    async fn before_write(&self) -> RemoteResult<()> {
        loop {
            // Created before the check so a release in between is not missed.
            let released = self.gate.notified();
            if !self.held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        self.check_online()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected {
                status: 503,
                message: "writes rejected".into(),
            });
        }
        Ok(())
    }

    fn log(&self, call: BackendCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn with_collection<R>(
        &self,
        uid: &str,
        collection: &str,
        f: impl FnOnce(&mut BTreeMap<SubjectId, Value>) -> R,
    ) -> R {
        let mut collections = self
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(collections
            .entry((uid.to_string(), collection.to_string()))
            .or_default())
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn list(&self, identity: &Identity, collection: &str) -> RemoteResult<Vec<Document>> {
        self.check_online()?;
        let documents = self
            .documents(&identity.uid, collection)
            .into_iter()
            .map(|(id, data)| Document { id, data })
            .collect();
        self.log(BackendCall::List {
            uid: identity.uid.clone(),
            collection: collection.to_string(),
        });
        Ok(documents)
    }

    async fn set(
        &self,
        identity: &Identity,
        collection: &str,
        id: &str,
        data: Value,
    ) -> RemoteResult<()> {
        self.before_write().await?;
        self.with_collection(&identity.uid, collection, |docs| {
            docs.insert(id.to_string(), data);
        });
        self.log(BackendCall::Set {
            uid: identity.uid.clone(),
            collection: collection.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, identity: &Identity, collection: &str, id: &str) -> RemoteResult<()> {
        self.before_write().await?;
        self.with_collection(&identity.uid, collection, |docs| {
            docs.remove(id);
        });
        self.log(BackendCall::Delete {
            uid: identity.uid.clone(),
            collection: collection.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn commit(
        &self,
        identity: &Identity,
        collection: &str,
        writes: Vec<BatchWrite>,
    ) -> RemoteResult<()> {
        self.before_write().await?;
        let count = writes.len();
        self.with_collection(&identity.uid, collection, |docs| {
            for write in writes {
                match write {
                    BatchWrite::Set { id, data } => {
                        docs.insert(id, data);
                    }
                    BatchWrite::Delete { id } => {
                        docs.remove(&id);
                    }
                }
            }
        });
        self.log(BackendCall::Commit {
            uid: identity.uid.clone(),
            collection: collection.to_string(),
            writes: count,
        });
        Ok(())
    }
}
