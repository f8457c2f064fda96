//! # Remote Store Adapter
//!
//! Thin capability surface over an external document service.
//!
//! The adapter owns the current identity, publishes identity transitions on
//! the [`EventBus`], and forwards CRUD calls to a [`DocumentBackend`]. When no
//! backend is attached (offline start, or the service was never configured)
//! every call resolves to [`RemoteError::Unavailable`] instead of failing
//! harder, so engines keep working in local-only mode.
//!
//! ## Remote layout
//!
//! ```text
//! users/{uid}/{collection}/{subject_id} -> { createdAt, ...fields }
//! ```

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RemoteError, RemoteResult};
use crate::event::{
    EventBus, Payload, Subscription, IDENTITY_SIGNED_IN, IDENTITY_SIGNED_OUT, REMOTE_READY,
};
use crate::record::SubjectId;

/// The currently authenticated user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user id issued by the identity provider.
    pub uid: String,
    /// Optional display email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Bearer token for the document service. Never serialized.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Identity {
    /// Create an identity with only a uid.
    #[must_use]
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            token: None,
        }
    }

    /// Attach a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Attach a display email.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("uid", &self.uid)
            .field("email", &self.email)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A document as stored by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id (the subject id).
    pub id: SubjectId,
    /// Document body.
    pub data: Value,
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum BatchWrite {
    /// Upsert a document.
    Set {
        /// Document id.
        id: SubjectId,
        /// Full document body.
        data: Value,
    },
    /// Delete a document.
    Delete {
        /// Document id.
        id: SubjectId,
    },
}

/// External document service reachable only through get/set/delete/batch.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Fetch every document of `collection` for `identity`.
    async fn list(&self, identity: &Identity, collection: &str) -> RemoteResult<Vec<Document>>;

    /// Upsert one document.
    async fn set(
        &self,
        identity: &Identity,
        collection: &str,
        id: &str,
        data: Value,
    ) -> RemoteResult<()>;

    /// Delete one document. Deleting a missing document succeeds.
    async fn delete(&self, identity: &Identity, collection: &str, id: &str) -> RemoteResult<()>;

    /// Apply `writes` atomically.
    async fn commit(
        &self,
        identity: &Identity,
        collection: &str,
        writes: Vec<BatchWrite>,
    ) -> RemoteResult<()>;
}

type SharedBackend = Arc<dyn DocumentBackend>;

/// Adapter consumed by the sync engines.
pub struct RemoteStore {
    bus: EventBus,
    backend: RwLock<Option<SharedBackend>>,
    identity: RwLock<Option<Identity>>,
}

impl fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStore")
            .field("ready", &self.is_ready())
            .field("identity", &self.current_identity())
            .finish_non_exhaustive()
    }
}

impl RemoteStore {
    /// Create an adapter with no backend attached.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            backend: RwLock::new(None),
            identity: RwLock::new(None),
        }
    }

    /// Create an adapter with `backend` already attached.
    #[must_use]
    pub fn with_backend(bus: EventBus, backend: SharedBackend) -> Self {
        let store = Self::new(bus);
        *store
            .backend
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(backend);
        store
    }

    /// Attach a backend and announce `remote:ready`.
    pub fn attach(&self, backend: SharedBackend) {
        *self
            .backend
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(backend);
        tracing::info!("remote backend attached");
        self.bus.emit(REMOTE_READY, Payload::Empty);
    }

    /// Whether a backend is attached.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `callback` once the backend is attached.
    ///
    /// Runs immediately when already attached; otherwise registers a one-shot
    /// handler for `remote:ready`.
    pub fn on_ready<F>(&self, callback: F) -> Option<Subscription>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_ready() {
            callback();
            return None;
        }
        Some(self.bus.once(REMOTE_READY, move |_| callback()))
    }

    /// The identity currently signed in, if any.
    #[must_use]
    pub fn current_identity(&self) -> Option<Identity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the identity provider's signal and publish it.
    ///
    /// `Some` emits `identity:signed-in`, `None` emits `identity:signed-out`.
    /// The signal is re-published even when unchanged (e.g. a token refresh).
    pub fn set_identity(&self, identity: Option<Identity>) {
        *self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = identity.clone();
        match identity {
            Some(identity) => {
                tracing::info!(uid = %identity.uid, "identity signed in");
                self.bus.emit(IDENTITY_SIGNED_IN, Payload::Identity(identity));
            }
            None => {
                tracing::info!("identity signed out");
                self.bus.emit(IDENTITY_SIGNED_OUT, Payload::Empty);
            }
        }
    }

    /// Subscribe to identity transitions.
    ///
    /// The callback receives the new identity, or `None` on sign-out.
    pub fn on_identity_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Option<&Identity>) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let on_sign_in = Arc::clone(&callback);
        let signed_in = self.bus.on(IDENTITY_SIGNED_IN, move |payload| {
            if let Payload::Identity(identity) = payload {
                on_sign_in(Some(identity));
            }
        });
        let signed_out = self
            .bus
            .on(IDENTITY_SIGNED_OUT, move |_| callback(None));
        signed_in.and(signed_out)
    }

    /// Fetch every record of `collection` for `identity`.
    ///
    /// # Errors
    ///
    /// [`RemoteError::Unavailable`] when no backend is attached or it is
    /// unreachable; any other backend error otherwise.
    pub async fn read_all(
        &self,
        identity: &Identity,
        collection: &str,
    ) -> RemoteResult<Vec<(SubjectId, Value)>> {
        let backend = self.backend()?;
        let documents = backend.list(identity, collection).await?;
        Ok(documents.into_iter().map(|d| (d.id, d.data)).collect())
    }

    /// Upsert one record.
    ///
    /// # Errors
    ///
    /// See [`RemoteStore::read_all`].
    pub async fn write_one(
        &self,
        identity: &Identity,
        collection: &str,
        subject_id: &str,
        data: Value,
    ) -> RemoteResult<()> {
        let backend = self.backend()?;
        backend.set(identity, collection, subject_id, data).await
    }

    /// Delete one record.
    ///
    /// # Errors
    ///
    /// See [`RemoteStore::read_all`].
    pub async fn delete_one(
        &self,
        identity: &Identity,
        collection: &str,
        subject_id: &str,
    ) -> RemoteResult<()> {
        let backend = self.backend()?;
        backend.delete(identity, collection, subject_id).await
    }

    /// Upsert many records in one atomic batch. An empty batch is not sent.
    ///
    /// # Errors
    ///
    /// See [`RemoteStore::read_all`].
    pub async fn write_batch(
        &self,
        identity: &Identity,
        collection: &str,
        entries: Vec<(SubjectId, Value)>,
    ) -> RemoteResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let backend = self.backend()?;
        let writes = entries
            .into_iter()
            .map(|(id, data)| BatchWrite::Set { id, data })
            .collect();
        backend.commit(identity, collection, writes).await
    }

    /// Delete many records in one atomic batch. An empty batch is not sent.
    ///
    /// # Errors
    ///
    /// See [`RemoteStore::read_all`].
    pub async fn delete_batch(
        &self,
        identity: &Identity,
        collection: &str,
        subject_ids: Vec<SubjectId>,
    ) -> RemoteResult<()> {
        if subject_ids.is_empty() {
            return Ok(());
        }
        let backend = self.backend()?;
        let writes = subject_ids
            .into_iter()
            .map(|id| BatchWrite::Delete { id })
            .collect();
        backend.commit(identity, collection, writes).await
    }

    fn backend(&self) -> RemoteResult<SharedBackend> {
        self.backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| RemoteError::Unavailable("no backend attached".into()))
    }
}
