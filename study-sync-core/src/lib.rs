//! # Study Sync Core
//!
//! Offline-first synchronization of "done" and "flagged" study items.
//! Every mutation lands in memory and in a device-local mirror immediately,
//! then propagates to a remote document service when an identity is signed
//! in and the service is reachable.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Coordinator                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  SyncEngine<Completion>  SyncEngine<QuestionFlag>  ...   │
//! │  - in-memory map          - optimistic dual-write        │
//! │  - reconciliation         - import / export              │
//! ├───────────────────┬─────────────────┬────────────────────┤
//! │  LocalCache       │  EventBus       │  RemoteStore       │
//! │  - file / memory  │  - topics       │  - identity        │
//! │  - sync writes    │  - history      │  - DocumentBackend │
//! └───────────────────┴─────────────────┴────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod event;
pub mod flags;
pub mod merge;
pub mod progress;
pub mod record;
pub mod remote;
mod telemetry;

pub use backend::{BackendCall, MemoryBackend};
pub use cache::{FileCache, LocalCache, MemoryCache};
pub use config::SyncConfig;
pub use coordinator::{Backup, BackupSummary, Coordinator};
pub use engine::{ImportSummary, Snapshot, SyncEngine, SNAPSHOT_VERSION};
pub use error::{CacheError, ImportError, RemoteError, RemoteResult};
pub use event::{
    EventBus, HandlerId, HistoryEntry, Payload, Subscription, SyncOperation, SyncSummary,
};
pub use flags::FlagStats;
pub use merge::{merge, MergeOutcome};
pub use progress::{Progress, Roster, StaticRoster};
pub use record::{
    CaseFlag, CaseFlagFields, Completion, CompletionFields, Domain, FlagId, QuestionFlag,
    QuestionFlagFields, Record, RecordMap, Stats, SubjectId,
};
pub use remote::{BatchWrite, Document, DocumentBackend, Identity, RemoteStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
