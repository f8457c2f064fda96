//! # Event Bus
//!
//! Process-wide publish/subscribe hub.
//!
//! Handlers run synchronously, in subscription order, inside the call to
//! [`EventBus::emit`]. A panicking handler is isolated and logged so its
//! siblings still run. The bus also keeps a bounded history of recent
//! emissions for diagnostics; behaviour must never depend on it.
//!
//! ## Topics
//!
//! ```text
//! <domain>:set          Record { subject_id, stats }
//! <domain>:cleared-one  Record { subject_id, stats }
//! <domain>:synced       Synced { total, from_remote, from_local_push }
//! <domain>:cleared      Empty
//! <domain>:imported     Imported { imported, stats }
//! <domain>:loaded       Loaded { total }
//! <domain>:error        Error { operation, subject_id?, message }
//! identity:signed-in    Identity(identity)
//! identity:signed-out   Empty
//! remote:ready          Empty
//! app:ready             Empty
//! ```

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde::{Deserialize, Serialize};

use crate::record::{current_timestamp_ms, Stats, SubjectId};
use crate::remote::Identity;
use crate::telemetry;

/// Default number of emissions kept in the diagnostic history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Topic emitted when an identity signs in.
pub const IDENTITY_SIGNED_IN: &str = "identity:signed-in";
/// Topic emitted when the identity is cleared.
pub const IDENTITY_SIGNED_OUT: &str = "identity:signed-out";
/// Topic emitted once a remote backend is attached.
pub const REMOTE_READY: &str = "remote:ready";
/// Topic emitted once the coordinator has wired every engine.
pub const APP_READY: &str = "app:ready";

/// Build a domain topic such as `completion:set`.
#[must_use]
pub fn domain_topic(domain: &str, suffix: &str) -> String {
    format!("{domain}:{suffix}")
}

/// Suffixes of the per-domain topics.
pub mod suffix {
    /// A record was created or overwritten.
    pub const SET: &str = "set";
    /// A single record was removed.
    pub const CLEARED_ONE: &str = "cleared-one";
    /// Reconciliation finished.
    pub const SYNCED: &str = "synced";
    /// Every record was discarded (sign-out or bulk clear).
    pub const CLEARED: &str = "cleared";
    /// A snapshot was merged in.
    pub const IMPORTED: &str = "imported";
    /// Records were loaded from the local mirror at startup.
    pub const LOADED: &str = "loaded";
    /// A local or remote operation failed.
    pub const ERROR: &str = "error";
}

/// Operation named in an error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOperation {
    /// Writing the local mirror.
    SaveLocal,
    /// Deleting the local mirror.
    RemoveLocal,
    /// Fetching remote records during reconciliation.
    Reconcile,
    /// Pushing local-only records in one batch.
    PushBatch,
    /// Writing one record remotely.
    WriteRemote,
    /// Deleting one record remotely.
    DeleteRemote,
    /// Deleting every remote record in one batch.
    ClearRemote,
}

impl SyncOperation {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SaveLocal => "save-local",
            Self::RemoveLocal => "remove-local",
            Self::Reconcile => "reconcile",
            Self::PushBatch => "push-batch",
            Self::WriteRemote => "write-remote",
            Self::DeleteRemote => "delete-remote",
            Self::ClearRemote => "clear-remote",
        }
    }
}

/// Counts reported when reconciliation completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Records in the merged map.
    pub total: usize,
    /// Records fetched from the remote store.
    pub from_remote: usize,
    /// Local-only records pushed to the remote store.
    pub from_local_push: usize,
}

/// Error details carried by `<domain>:error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// The operation that failed.
    pub operation: SyncOperation,
    /// Subject involved, when the failure concerns one record.
    pub subject_id: Option<SubjectId>,
    /// Human readable failure message.
    pub message: String,
}

/// Payload delivered with an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// No data.
    Empty,
    /// The identity that signed in.
    Identity(Identity),
    /// A single record changed.
    Record {
        /// Subject whose record changed.
        subject_id: SubjectId,
        /// Stats after the change.
        stats: Stats,
    },
    /// Reconciliation finished.
    Synced(SyncSummary),
    /// A snapshot was merged in.
    Imported {
        /// Number of records in the imported snapshot.
        imported: usize,
        /// Stats after the merge.
        stats: Stats,
    },
    /// Records loaded from the local mirror.
    Loaded {
        /// Number of records loaded.
        total: usize,
    },
    /// An operation failed.
    Error(ErrorReport),
}

/// One entry of the diagnostic history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// Topic the payload was emitted on.
    pub topic: String,
    /// Emitted payload.
    pub payload: Payload,
    /// Emission time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Identifier of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Payload) + Send + Sync>;

struct BusInner {
    listeners: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    history: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, topic: &str, id: HandlerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = listeners.get_mut(topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            listeners.remove(topic);
        }
        removed
    }
}

/// Publish/subscribe hub shared by every component.
///
/// Cloning is cheap and yields a handle to the same bus.
///
/// # Example
///
/// ```
/// use study_sync_core::event::{EventBus, Payload};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let bus = EventBus::new();
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
/// let sub = bus.on("completion:set", move |_| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// bus.emit("completion:set", Payload::Empty);
/// sub.unsubscribe();
/// bus.emit("completion:set", Payload::Empty);
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topics())
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default history capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a bus that keeps at most `capacity` history entries.
    #[must_use]
    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe `handler` to `topic`.
    ///
    /// The returned [`Subscription`] removes the handler when
    /// [`Subscription::unsubscribe`] is called. Dropping it keeps the handler.
    pub fn on<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        let id = self.register(topic, Arc::new(handler));
        Subscription::single(&self.inner, topic, id)
    }

    /// Subscribe `handler` to the next emission on `topic` only.
    pub fn once<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let weak = Arc::downgrade(&self.inner);
        let owned_topic = topic.to_string();
        let wrapper = move |payload: &Payload| {
            // Remove first; a handler that re-emits must not fire twice.
            let still_registered = weak
                .upgrade()
                .is_some_and(|inner| inner.remove(&owned_topic, id));
            if still_registered {
                handler(payload);
            }
        };
        self.insert(topic, id, Arc::new(wrapper));
        Subscription::single(&self.inner, topic, id)
    }

    /// Remove the handler registered under `id` from `topic`.
    ///
    /// Returns false if no such handler was registered.
    pub fn off(&self, topic: &str, id: HandlerId) -> bool {
        self.inner.remove(topic, id)
    }

    /// Emit `payload` to every handler of `topic`.
    ///
    /// Emitting with no subscribers is a silent no-op (apart from history).
    pub fn emit(&self, topic: &str, payload: Payload) {
        self.record(topic, &payload);

        // Snapshot so handlers may subscribe, unsubscribe or emit re-entrantly.
        let handlers: Vec<Handler> = {
            let listeners = self
                .inner
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match listeners.get(topic) {
                Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&payload))).is_err() {
                tracing::error!(topic, "event handler panicked; continuing with siblings");
                telemetry::record_handler_panic(topic);
            }
        }
    }

    /// Remove every handler of `topic`, or of all topics when `None`.
    pub fn clear(&self, topic: Option<&str>) {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match topic {
            Some(topic) => {
                listeners.remove(topic);
            }
            None => listeners.clear(),
        }
    }

    /// Topics that currently have at least one handler, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let listeners = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut topics: Vec<String> = listeners.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of handlers registered for `topic`.
    #[must_use]
    pub fn listener_count(&self, topic: &str) -> usize {
        let listeners = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.get(topic).map_or(0, Vec::len)
    }

    /// The most recent `count` emissions, oldest first.
    #[must_use]
    pub fn history(&self, count: usize) -> Vec<HistoryEntry> {
        let history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(count);
        history.iter().skip(skip).cloned().collect()
    }

    fn register(&self, topic: &str, handler: Handler) -> HandlerId {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.insert(topic, id, handler);
        id
    }

    fn insert(&self, topic: &str, id: HandlerId, handler: Handler) {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        listeners
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
    }

    fn record(&self, topic: &str, payload: &Payload) {
        if self.inner.capacity == 0 {
            return;
        }
        let mut history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if history.len() >= self.inner.capacity {
            history.pop_front();
        }
        history.push_back(HistoryEntry {
            topic: topic.to_string(),
            payload: payload.clone(),
            timestamp: current_timestamp_ms(),
        });
    }
}

/// Handle to one or more registered handlers.
#[derive(Debug, Clone)]
pub struct Subscription {
    bus: Weak<BusInner>,
    entries: Vec<(String, HandlerId)>,
}

impl Subscription {
    fn single(inner: &Arc<BusInner>, topic: &str, id: HandlerId) -> Self {
        Self {
            bus: Arc::downgrade(inner),
            entries: vec![(topic.to_string(), id)],
        }
    }

    /// Combine two subscriptions so that one call removes both.
    #[must_use]
    pub fn and(mut self, other: Self) -> Self {
        self.entries.extend(other.entries);
        self
    }

    /// Identifiers of the handlers covered by this subscription.
    #[must_use]
    pub fn ids(&self) -> Vec<HandlerId> {
        self.entries.iter().map(|(_, id)| *id).collect()
    }

    /// Remove every handler covered by this subscription.
    ///
    /// A no-op if the bus has already been dropped.
    pub fn unsubscribe(self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        for (topic, id) in &self.entries {
            inner.remove(topic, *id);
        }
    }
}
