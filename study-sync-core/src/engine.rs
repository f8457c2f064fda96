//! # Sync Engine
//!
//! Owns the in-memory record map of one domain and keeps two mirrors of it:
//! the local cache (written synchronously after every mutation) and the remote
//! store (written best-effort, asynchronously).
//!
//! ## Lifecycle
//!
//! ```text
//! start      load local mirror -> subscribe to identity changes
//! sign-in    tag mirror owner (discard another uid's map) -> reconcile:
//!            fetch remote, merge (remote wins), push local-only
//! mutation   map -> local mirror -> `<domain>:set` -> spawn remote write
//! sign-out   drop map, delete local mirror, `<domain>:cleared`
//! ```
//!
//! Local state changes never wait on the network. Remote failures are logged
//! and reported as `<domain>:error`; they are never retried and never roll
//! back local state. Nothing here returns an error across the mutation API.
//!
//! Remote work runs on the tokio runtime that was current when the engine
//! started. Without one the engine stays local-only.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::cache::LocalCache;
use crate::error::{CacheError, ImportError, RemoteError};
use crate::event::{
    domain_topic, suffix, ErrorReport, EventBus, Payload, Subscription, SyncOperation,
    SyncSummary,
};
use crate::merge::merge;
use crate::progress::{Progress, Roster};
use crate::record::{current_timestamp_ms, Domain, Record, RecordMap, Stats, SubjectId};
use crate::remote::{Identity, RemoteStore};
use crate::telemetry;

/// Version written into exported snapshots.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Snapshot versions accepted on import.
const SUPPORTED_VERSIONS: [&str; 2] = ["1", "1.0"];

/// Versioned export of one domain's records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot<F> {
    /// Snapshot format version.
    pub version: String,
    /// Export time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub exported_at: u64,
    /// Exported records keyed by subject id.
    pub records: RecordMap<F>,
}

impl<F> Snapshot<F> {
    /// Check the version and subject ids without applying anything.
    ///
    /// # Errors
    ///
    /// [`ImportError::UnsupportedVersion`] for an unknown version,
    /// [`ImportError::InvalidSubject`] for an empty subject id.
    pub fn validate(&self) -> Result<(), ImportError> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            return Err(ImportError::UnsupportedVersion(self.version.clone()));
        }
        if let Some(id) = self.records.keys().find(|id| id.trim().is_empty()) {
            return Err(ImportError::InvalidSubject(id.clone()));
        }
        Ok(())
    }
}

/// Outcome of a successful import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    /// Records contained in the imported snapshot.
    pub imported: usize,
    /// Records held after the merge.
    pub total: usize,
}

/// Local mirror layout, as written.
#[derive(Serialize)]
struct MirrorRef<'a, F> {
    owner: Option<&'a str>,
    records: &'a RecordMap<F>,
}

/// Local mirror layout, as read. A bare record map is accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredMirror<F> {
    Document {
        #[serde(default)]
        owner: Option<String>,
        records: RecordMap<F>,
    },
    Bare(RecordMap<F>),
}

struct EngineInner<D: Domain> {
    records: RwLock<RecordMap<D::Fields>>,
    /// Uid whose data the map mirrors; `None` for anonymous local work.
    owner: RwLock<Option<String>>,
    identity: RwLock<Option<Identity>>,
    /// Bumped whenever the map is discarded, so stale async work is dropped.
    epoch: AtomicU64,
    cache: Arc<dyn LocalCache>,
    remote: Arc<RemoteStore>,
    bus: EventBus,
    runtime: Option<Handle>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<Subscription>>,
    _domain: PhantomData<D>,
}

/// Offline-first sync engine for one domain.
///
/// Cloning yields another handle to the same engine.
pub struct SyncEngine<D: Domain> {
    inner: Arc<EngineInner<D>>,
}

impl<D: Domain> Clone for SyncEngine<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Domain> fmt::Debug for SyncEngine<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("domain", &D::NAME)
            .field("records", &self.len())
            .field("identity", &self.identity().map(|i| i.uid))
            .finish_non_exhaustive()
    }
}

impl<D: Domain> SyncEngine<D> {
    /// Load the local mirror and subscribe to identity changes.
    ///
    /// A missing or corrupt mirror yields an empty map. If an identity is
    /// already signed in, reconciliation is started right away.
    #[must_use]
    pub fn start(cache: Arc<dyn LocalCache>, remote: Arc<RemoteStore>, bus: EventBus) -> Self {
        let (records, owner) = load_mirror::<D>(cache.as_ref());
        let total = records.len();
        let identity = remote.current_identity();

        let inner = Arc::new(EngineInner {
            records: RwLock::new(records),
            owner: RwLock::new(owner),
            identity: RwLock::new(None),
            epoch: AtomicU64::new(0),
            cache,
            remote,
            bus,
            runtime: Handle::try_current().ok(),
            in_flight: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            _domain: PhantomData,
        });

        let weak: Weak<EngineInner<D>> = Arc::downgrade(&inner);
        let subscription = inner.remote.on_identity_change(move |identity| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match identity {
                Some(identity) => inner.handle_signed_in(identity.clone()),
                None => inner.handle_signed_out(),
            }
        });
        *inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);

        tracing::debug!(domain = D::NAME, total, "loaded local mirror");
        inner.emit(suffix::LOADED, Payload::Loaded { total });

        if let Some(identity) = identity {
            inner.handle_signed_in(identity);
        }

        Self { inner }
    }

    /// Topic prefix of this engine's domain.
    #[must_use]
    pub fn domain(&self) -> &'static str {
        D::NAME
    }

    /// Identity the engine currently propagates to, if any.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        self.inner.current_identity()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Whether `subject_id` has a record.
    #[must_use]
    pub fn has(&self, subject_id: &str) -> bool {
        self.inner.read_records().contains_key(subject_id)
    }

    /// The record stored for `subject_id`, if any.
    #[must_use]
    pub fn get(&self, subject_id: &str) -> Option<Record<D::Fields>> {
        self.inner.read_records().get(subject_id).cloned()
    }

    /// Copy of every record, ordered by subject id.
    #[must_use]
    pub fn all(&self) -> Vec<(SubjectId, Record<D::Fields>)> {
        self.inner
            .read_records()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    /// Copy of the whole map.
    #[must_use]
    pub fn snapshot(&self) -> RecordMap<D::Fields> {
        self.inner.read_records().clone()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read_records().len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read_records().is_empty()
    }

    /// Stats snapshot as attached to mutation events.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// Number of records whose subject id satisfies `predicate`.
    #[must_use]
    pub fn count_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        self.inner
            .read_records()
            .keys()
            .filter(|id| predicate(id))
            .count()
    }

    /// Number of records whose subject id starts with `prefix`.
    #[must_use]
    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.count_where(|id| id.starts_with(prefix))
    }

    /// Progress over an explicit list of subjects.
    #[must_use]
    pub fn progress_for<I, S>(&self, subjects: I) -> Progress
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let records = self.inner.read_records();
        let (completed, total) = subjects
            .into_iter()
            .fold((0, 0), |(completed, total), subject| {
                let hit = usize::from(records.contains_key(subject.as_ref()));
                (completed + hit, total + 1)
            });
        Progress::new(completed, total)
    }

    /// Progress over one roster category.
    #[must_use]
    pub fn progress_in<R: Roster + ?Sized>(&self, roster: &R, category: &str) -> Progress {
        self.progress_for(roster.subjects(category))
    }

    /// Progress over every subject of the roster.
    #[must_use]
    pub fn progress_overall<R: Roster + ?Sized>(&self, roster: &R) -> Progress {
        self.progress_for(roster.all_subjects())
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Create or overwrite the record for `subject_id`.
    ///
    /// The map, the local mirror and the `<domain>:set` event are all updated
    /// before this returns; the remote write is spawned afterwards. Returns
    /// false (and logs a warning) for an empty subject id.
    pub fn set_record(&self, subject_id: &str, fields: D::Fields) -> bool {
        if subject_id.trim().is_empty() {
            tracing::warn!(domain = D::NAME, "ignoring set_record with empty subject id");
            return false;
        }
        let record = Record::new(fields);
        let identity = self.inner.mutate(Some(subject_id), |records| {
            records.insert(subject_id.to_string(), record.clone());
            Some(self.inner.current_identity())
        });
        telemetry::record_mutation(D::NAME, suffix::SET);
        tracing::debug!(domain = D::NAME, subject_id, "record set");
        self.inner.emit_record(suffix::SET, subject_id);
        self.inner
            .propagate_write(identity.flatten(), subject_id.to_string(), record);
        true
    }

    /// Remove the record for `subject_id`.
    ///
    /// Returns false, with no side effects, when there is no such record or
    /// the id is empty.
    pub fn clear_record(&self, subject_id: &str) -> bool {
        if subject_id.trim().is_empty() {
            tracing::warn!(domain = D::NAME, "ignoring clear_record with empty subject id");
            return false;
        }
        let removed = self.inner.mutate(Some(subject_id), |records| {
            records
                .remove(subject_id)
                .map(|_| self.inner.current_identity())
        });
        let Some(identity) = removed else {
            tracing::debug!(domain = D::NAME, subject_id, "no record to clear");
            return false;
        };

        telemetry::record_mutation(D::NAME, suffix::CLEARED_ONE);
        tracing::debug!(domain = D::NAME, subject_id, "record cleared");
        self.inner.emit_record(suffix::CLEARED_ONE, subject_id);
        self.inner.propagate_delete(identity, subject_id.to_string());
        true
    }

    /// Clear the record if present, otherwise set it.
    ///
    /// Returns whether a record is present afterwards.
    pub fn toggle(&self, subject_id: &str, fields: D::Fields) -> bool {
        if self.has(subject_id) {
            self.clear_record(subject_id);
            false
        } else {
            self.set_record(subject_id, fields)
        }
    }

    /// Delete every record locally and, when signed in, remotely.
    ///
    /// Confirmation is the caller's concern; this always clears.
    pub fn clear_all(&self) {
        let (local_ids, identity): (Vec<SubjectId>, _) = self
            .inner
            .mutate(None, |records| {
                let ids = records.keys().cloned().collect();
                records.clear();
                Some((ids, self.inner.current_identity()))
            })
            .unwrap_or_default();
        telemetry::record_mutation(D::NAME, suffix::CLEARED);
        tracing::info!(domain = D::NAME, cleared = local_ids.len(), "cleared all records");
        self.inner.emit(suffix::CLEARED, Payload::Empty);
        self.inner.propagate_clear(identity, local_ids);
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Merge the remote record set into the map.
    ///
    /// Remote values win on conflict, local-only records are pushed in one
    /// batch, and `<domain>:synced` is emitted. Returns `None` when there is
    /// no identity, the remote is unreachable or failed, or the identity
    /// changed while the fetch was in flight. Safe to run repeatedly.
    pub async fn reconcile(&self) -> Option<SyncSummary> {
        self.inner.reconcile().await
    }

    /// Wait for every spawned remote operation to settle.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Stop reacting to identity changes.
    pub fn detach(&self) {
        let subscription = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }

    // -----------------------------------------------------------------------
    // Import / export
    // -----------------------------------------------------------------------

    /// Versioned copy of the current map.
    #[must_use]
    pub fn export(&self) -> Snapshot<D::Fields> {
        Snapshot {
            version: SNAPSHOT_VERSION.to_string(),
            exported_at: current_timestamp_ms(),
            records: self.snapshot(),
        }
    }

    /// [`SyncEngine::export`] as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be serialized.
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.export())
    }

    /// Merge `snapshot` into the map; incoming records win on conflict.
    ///
    /// The snapshot is validated before anything changes. Nothing is ever
    /// removed by an import. When signed in, records missing remotely are
    /// pushed in the background.
    ///
    /// # Errors
    ///
    /// See [`Snapshot::validate`]; on error the map is untouched.
    pub fn import(&self, snapshot: Snapshot<D::Fields>) -> Result<ImportSummary, ImportError> {
        snapshot.validate()?;
        let imported = snapshot.records.len();
        let (total, identity) = self
            .inner
            .mutate(None, |records| {
                *records = merge(records, &snapshot.records).merged;
                Some((
                    records.len(),
                    self.inner.current_identity(),
                    self.inner.epoch.load(Ordering::SeqCst),
                ))
            })
            .map_or((0, None), |(total, identity, epoch)| {
                (total, identity.map(|identity| (identity, epoch)))
            });

        telemetry::record_mutation(D::NAME, suffix::IMPORTED);
        tracing::info!(domain = D::NAME, imported, total, "imported snapshot");
        self.inner.emit(
            suffix::IMPORTED,
            Payload::Imported {
                imported,
                stats: Stats { total },
            },
        );
        if let Some((identity, epoch)) = identity {
            self.inner.propagate_missing(identity, epoch);
        }
        Ok(ImportSummary { imported, total })
    }

    /// Parse a JSON snapshot and [`import`](SyncEngine::import) it.
    ///
    /// # Errors
    ///
    /// [`ImportError::Malformed`] if `json` does not parse, otherwise as
    /// [`SyncEngine::import`].
    pub fn import_json(&self, json: &str) -> Result<ImportSummary, ImportError> {
        let snapshot: Snapshot<D::Fields> = serde_json::from_str(json)?;
        self.import(snapshot)
    }
}

impl<D: Domain> EngineInner<D> {
    fn read_records(&self) -> std::sync::RwLockReadGuard<'_, RecordMap<D::Fields>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_records(&self) -> std::sync::RwLockWriteGuard<'_, RecordMap<D::Fields>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_identity(&self) -> Option<Identity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_owner(&self, owner: Option<String>) {
        *self.owner.write().unwrap_or_else(PoisonError::into_inner) = owner;
    }

    fn stats(&self) -> Stats {
        Stats {
            total: self.read_records().len(),
        }
    }

    fn emit(&self, suffix: &str, payload: Payload) {
        self.bus.emit(&domain_topic(D::NAME, suffix), payload);
    }

    fn emit_record(&self, suffix: &str, subject_id: &str) {
        self.emit(
            suffix,
            Payload::Record {
                subject_id: subject_id.to_string(),
                stats: self.stats(),
            },
        );
    }

    fn emit_error(&self, operation: SyncOperation, subject_id: Option<&str>, message: String) {
        self.emit(
            suffix::ERROR,
            Payload::Error(ErrorReport {
                operation,
                subject_id: subject_id.map(str::to_string),
                message,
            }),
        );
    }

    /// Write `records` to the local mirror, tagged with the current owner.
    ///
    /// Callers hold the records write lock so the mirror never lags behind a
    /// concurrent discard.
    fn write_mirror(&self, records: &RecordMap<D::Fields>) -> Result<(), CacheError> {
        let json = {
            let owner = self.owner.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string(&MirrorRef {
                owner: owner.as_deref(),
                records,
            })?
        };
        self.cache.set(D::STORAGE_KEY, &json)
    }

    fn report_local_failure(
        &self,
        operation: SyncOperation,
        subject_id: Option<&str>,
        error: &CacheError,
    ) {
        tracing::warn!(
            domain = D::NAME,
            operation = operation.as_str(),
            error = %error,
            "local mirror update failed"
        );
        telemetry::record_local_failure(D::NAME);
        self.emit_error(operation, subject_id, error.to_string());
    }

    /// Apply `change` to the map and, when it returns `Some`, rewrite the
    /// mirror under the same lock. Failures are reported after the lock is
    /// released.
    fn mutate<R>(
        &self,
        subject_id: Option<&str>,
        change: impl FnOnce(&mut RecordMap<D::Fields>) -> Option<R>,
    ) -> Option<R> {
        let (outcome, result) = {
            let mut records = self.write_records();
            let outcome = change(&mut records);
            let result = match outcome {
                Some(_) => self.write_mirror(&records),
                None => Ok(()),
            };
            (outcome, result)
        };
        if let Err(e) = result {
            self.report_local_failure(SyncOperation::SaveLocal, subject_id, &e);
        }
        outcome
    }

    /// Forget the identity and discard the map and its mirror, invalidating
    /// in-flight work.
    fn discard(&self) {
        let result = {
            let mut records = self.write_records();
            *self.identity.write().unwrap_or_else(PoisonError::into_inner) = None;
            self.epoch.fetch_add(1, Ordering::SeqCst);
            records.clear();
            self.set_owner(None);
            self.cache.remove(D::STORAGE_KEY)
        };
        if let Err(e) = result {
            self.report_local_failure(SyncOperation::RemoveLocal, None, &e);
        }
    }

    fn report_remote_failure(
        &self,
        operation: SyncOperation,
        subject_id: Option<&str>,
        error: &RemoteError,
    ) {
        if error.is_unavailable() {
            tracing::debug!(
                domain = D::NAME,
                operation = operation.as_str(),
                "remote unavailable; staying local"
            );
            return;
        }
        tracing::error!(
            domain = D::NAME,
            operation = operation.as_str(),
            subject_id,
            error = %error,
            "remote operation failed"
        );
        telemetry::record_remote_failure(D::NAME, operation.as_str());
        self.emit_error(operation, subject_id, error.to_string());
    }

    fn spawn<Fut>(&self, future: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = &self.runtime else {
            tracing::debug!(domain = D::NAME, "no async runtime; remote propagation skipped");
            return;
        };
        let handle = runtime.spawn(future);
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|task| !task.is_finished());
        in_flight.push(handle);
    }

    async fn flush(&self) {
        loop {
            let pending = std::mem::take(
                &mut *self
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            if pending.is_empty() {
                break;
            }
            for result in futures::future::join_all(pending).await {
                if let Err(e) = result {
                    tracing::error!(domain = D::NAME, error = %e, "remote task aborted");
                }
            }
        }
    }

    /// Adopt `identity` as the owner of the map and start reconciliation.
    ///
    /// A map owned by another uid is discarded first. Anonymous records are
    /// claimed by `identity`; the mirror is tagged before any remote call so
    /// an offline sign-in still marks whose data it holds.
    fn handle_signed_in(self: &Arc<Self>, identity: Identity) {
        let (switched, result) = {
            let mut records = self.write_records();
            *self.identity.write().unwrap_or_else(PoisonError::into_inner) = Some(identity.clone());
            let mut owner = self.owner.write().unwrap_or_else(PoisonError::into_inner);
            let switched = owner.as_deref().is_some_and(|uid| uid != identity.uid);
            if switched {
                self.epoch.fetch_add(1, Ordering::SeqCst);
                records.clear();
            }
            let claimed = owner.as_deref() != Some(identity.uid.as_str());
            *owner = Some(identity.uid.clone());
            drop(owner);
            let result = if claimed {
                self.write_mirror(&records)
            } else {
                Ok(())
            };
            (switched, result)
        };
        if let Err(e) = result {
            self.report_local_failure(SyncOperation::SaveLocal, None, &e);
        }

        if switched {
            tracing::info!(
                domain = D::NAME,
                uid = %identity.uid,
                "local mirror belonged to another identity; discarded"
            );
            self.emit(suffix::CLEARED, Payload::Empty);
        }

        let inner = Arc::clone(self);
        self.spawn(async move {
            inner.reconcile().await;
        });
    }

    fn handle_signed_out(&self) {
        self.discard();
        tracing::info!(domain = D::NAME, "signed out; local records discarded");
        self.emit(suffix::CLEARED, Payload::Empty);
    }

    /// Still signed in as `identity`, with no discard since `epoch`.
    fn is_current(&self, identity: &Identity, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
            && self
                .current_identity()
                .is_some_and(|current| current.uid == identity.uid)
    }

    async fn reconcile(&self) -> Option<SyncSummary> {
        let Some(identity) = self.current_identity() else {
            tracing::debug!(domain = D::NAME, "no identity; reconciliation skipped");
            telemetry::record_reconciliation(D::NAME, "skipped");
            return None;
        };
        let epoch = self.epoch.load(Ordering::SeqCst);

        let documents = match self.remote.read_all(&identity, D::COLLECTION).await {
            Ok(documents) => documents,
            Err(e) => {
                let outcome = if e.is_unavailable() { "skipped" } else { "failed" };
                telemetry::record_reconciliation(D::NAME, outcome);
                self.report_remote_failure(SyncOperation::Reconcile, None, &e);
                return None;
            }
        };
        let remote = decode_documents::<D>(documents);

        // Checked under the records lock; discards bump the epoch under it too.
        let merged = {
            let mut records = self.write_records();
            if self.is_current(&identity, epoch) {
                let outcome = merge(&records, &remote);
                records.clone_from(&outcome.merged);
                self.set_owner(Some(identity.uid.clone()));
                let result = self.write_mirror(&records);
                Some((outcome, result))
            } else {
                None
            }
        };
        let Some((outcome, result)) = merged else {
            tracing::debug!(domain = D::NAME, "identity changed during fetch; result discarded");
            telemetry::record_reconciliation(D::NAME, "discarded");
            return None;
        };
        if let Err(e) = result {
            self.report_local_failure(SyncOperation::SaveLocal, None, &e);
        }

        let pushed = self
            .push_records(&identity, &outcome.merged, &outcome.local_only)
            .await;

        if !self.is_current(&identity, epoch) {
            telemetry::record_reconciliation(D::NAME, "discarded");
            return None;
        }

        let summary = SyncSummary {
            total: outcome.merged.len(),
            from_remote: remote.len(),
            from_local_push: pushed,
        };
        tracing::info!(
            domain = D::NAME,
            uid = %identity.uid,
            total = summary.total,
            from_remote = summary.from_remote,
            from_local_push = summary.from_local_push,
            "reconciliation complete"
        );
        telemetry::record_reconciliation(D::NAME, "merged");
        self.emit(suffix::SYNCED, Payload::Synced(summary));
        Some(summary)
    }

    /// Push `ids` from `records` in one batch. Returns how many were written.
    async fn push_records(
        &self,
        identity: &Identity,
        records: &RecordMap<D::Fields>,
        ids: &[SubjectId],
    ) -> usize {
        let entries: Vec<(SubjectId, Value)> = ids
            .iter()
            .filter_map(|id| {
                let record = records.get(id)?;
                encode_record(id, record).map(|data| (id.clone(), data))
            })
            .collect();
        if entries.is_empty() {
            return 0;
        }
        let count = entries.len();
        match self
            .remote
            .write_batch(identity, D::COLLECTION, entries)
            .await
        {
            Ok(()) => {
                tracing::debug!(domain = D::NAME, count, "pushed local-only records");
                count
            }
            Err(e) => {
                self.report_remote_failure(SyncOperation::PushBatch, None, &e);
                0
            }
        }
    }

    fn propagate_write(
        self: &Arc<Self>,
        identity: Option<Identity>,
        subject_id: SubjectId,
        record: Record<D::Fields>,
    ) {
        let Some(identity) = identity else {
            return;
        };
        let Some(data) = encode_record(&subject_id, &record) else {
            return;
        };
        let inner = Arc::clone(self);
        self.spawn(async move {
            if let Err(e) = inner
                .remote
                .write_one(&identity, D::COLLECTION, &subject_id, data)
                .await
            {
                inner.report_remote_failure(SyncOperation::WriteRemote, Some(&subject_id), &e);
            }
        });
    }

    fn propagate_delete(self: &Arc<Self>, identity: Option<Identity>, subject_id: SubjectId) {
        let Some(identity) = identity else {
            return;
        };
        let inner = Arc::clone(self);
        self.spawn(async move {
            if let Err(e) = inner
                .remote
                .delete_one(&identity, D::COLLECTION, &subject_id)
                .await
            {
                inner.report_remote_failure(SyncOperation::DeleteRemote, Some(&subject_id), &e);
            }
        });
    }

    fn propagate_clear(self: &Arc<Self>, identity: Option<Identity>, local_ids: Vec<SubjectId>) {
        let Some(identity) = identity else {
            return;
        };
        let inner = Arc::clone(self);
        self.spawn(async move {
            let mut ids = local_ids;
            match inner.remote.read_all(&identity, D::COLLECTION).await {
                Ok(documents) => ids.extend(documents.into_iter().map(|(id, _)| id)),
                Err(e) => {
                    inner.report_remote_failure(SyncOperation::ClearRemote, None, &e);
                    if e.is_unavailable() {
                        return;
                    }
                }
            }
            ids.sort();
            ids.dedup();
            if let Err(e) = inner
                .remote
                .delete_batch(&identity, D::COLLECTION, ids)
                .await
            {
                inner.report_remote_failure(SyncOperation::ClearRemote, None, &e);
            }
        });
    }

    /// Push every record the remote does not have yet (the push half of
    /// reconciliation, without pulling remote values into the map).
    ///
    /// Dropped if the identity changed or the map was discarded while the
    /// listing was in flight.
    fn propagate_missing(self: &Arc<Self>, identity: Identity, epoch: u64) {
        let inner = Arc::clone(self);
        self.spawn(async move {
            let remote_ids: BTreeSet<SubjectId> =
                match inner.remote.read_all(&identity, D::COLLECTION).await {
                    Ok(documents) => documents.into_iter().map(|(id, _)| id).collect(),
                    Err(e) => {
                        inner.report_remote_failure(SyncOperation::PushBatch, None, &e);
                        return;
                    }
                };
            let pending = {
                let records = inner.read_records();
                inner.is_current(&identity, epoch).then(|| {
                    let missing: Vec<SubjectId> = records
                        .keys()
                        .filter(|id| !remote_ids.contains(*id))
                        .cloned()
                        .collect();
                    (records.clone(), missing)
                })
            };
            let Some((records, missing)) = pending else {
                tracing::debug!(domain = D::NAME, "identity changed before import push; skipped");
                return;
            };
            inner.push_records(&identity, &records, &missing).await;
        });
    }
}

fn encode_record<F: Serialize>(subject_id: &str, record: &Record<F>) -> Option<Value> {
    match serde_json::to_value(record) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(subject_id, error = %e, "record could not be encoded; not propagated");
            None
        }
    }
}

fn decode_documents<D: Domain>(documents: Vec<(SubjectId, Value)>) -> RecordMap<D::Fields> {
    documents
        .into_iter()
        .filter_map(|(id, data)| match serde_json::from_value(data) {
            Ok(record) => Some((id, record)),
            Err(e) => {
                tracing::warn!(
                    domain = D::NAME,
                    subject_id = %id,
                    error = %e,
                    "skipping malformed remote document"
                );
                None
            }
        })
        .collect()
}

fn load_mirror<D: Domain>(cache: &dyn LocalCache) -> (RecordMap<D::Fields>, Option<String>) {
    let json = match cache.get(D::STORAGE_KEY) {
        Ok(Some(json)) => json,
        Ok(None) => return (RecordMap::new(), None),
        Err(e) => {
            tracing::warn!(domain = D::NAME, error = %e, "local mirror unreadable; starting empty");
            return (RecordMap::new(), None);
        }
    };
    match serde_json::from_str::<StoredMirror<D::Fields>>(&json) {
        Ok(StoredMirror::Document { owner, records }) => (records, owner),
        Ok(StoredMirror::Bare(records)) => (records, None),
        Err(e) => {
            tracing::warn!(domain = D::NAME, error = %e, "local mirror corrupt; starting empty");
            (RecordMap::new(), None)
        }
    }
}
