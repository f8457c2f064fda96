//! # Coordinator
//!
//! Wires the shared pieces together: one [`EventBus`], one [`LocalCache`], one
//! [`RemoteStore`], and an engine per domain. It owns nothing else; all
//! record state lives in the engines.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{FileCache, LocalCache, MemoryCache};
use crate::config::SyncConfig;
use crate::engine::{ImportSummary, Snapshot, SyncEngine, SNAPSHOT_VERSION};
use crate::error::{CacheError, ImportError};
use crate::event::{EventBus, Payload, APP_READY};
use crate::flags::FlagStats;
use crate::record::{
    current_timestamp_ms, CaseFlag, CaseFlagFields, Completion, CompletionFields, QuestionFlag,
    QuestionFlagFields, RecordMap,
};
use crate::remote::{DocumentBackend, Identity, RemoteStore};

/// Every domain in one versioned document.
///
/// A section left out of an imported backup leaves that domain untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// Backup format version.
    pub version: String,
    /// Export time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub exported_at: u64,
    /// Completion records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completions: Option<RecordMap<CompletionFields>>,
    /// Question flag records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<RecordMap<QuestionFlagFields>>,
    /// Case flag records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_flags: Option<RecordMap<CaseFlagFields>>,
}

/// Per-domain results of a backup import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    /// Completion import, if the section was present.
    pub completions: Option<ImportSummary>,
    /// Question flag import, if the section was present.
    pub flags: Option<ImportSummary>,
    /// Case flag import, if the section was present.
    pub case_flags: Option<ImportSummary>,
}

/// Owner of the bus, the shared adapters and the three engines.
#[derive(Debug, Clone)]
pub struct Coordinator {
    bus: EventBus,
    remote: Arc<RemoteStore>,
    completions: SyncEngine<Completion>,
    flags: SyncEngine<QuestionFlag>,
    case_flags: SyncEngine<CaseFlag>,
}

impl Coordinator {
    /// Build everything from `config`, attaching `backend` when given.
    ///
    /// With a data directory the mirrors are files; otherwise they live in
    /// memory. Without a backend the engines run local-only.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the data directory cannot be created.
    pub fn new(
        config: &SyncConfig,
        backend: Option<Arc<dyn DocumentBackend>>,
    ) -> Result<Self, CacheError> {
        let cache: Arc<dyn LocalCache> = match &config.data_dir {
            Some(dir) => Arc::new(FileCache::new(dir)?),
            None => Arc::new(MemoryCache::new()),
        };
        let bus = EventBus::with_history_capacity(config.event_history);
        let remote = Arc::new(RemoteStore::new(bus.clone()));
        let coordinator = Self::with_parts(bus, cache, remote);
        if let Some(backend) = backend {
            coordinator.remote.attach(backend);
        }
        Ok(coordinator)
    }

    /// Build the engines over caller-supplied parts and emit `app:ready`.
    #[must_use]
    pub fn with_parts(bus: EventBus, cache: Arc<dyn LocalCache>, remote: Arc<RemoteStore>) -> Self {
        let completions = SyncEngine::start(Arc::clone(&cache), Arc::clone(&remote), bus.clone());
        let flags = SyncEngine::start(Arc::clone(&cache), Arc::clone(&remote), bus.clone());
        let case_flags = SyncEngine::start(cache, Arc::clone(&remote), bus.clone());

        tracing::info!(
            completions = completions.len(),
            flags = flags.len(),
            case_flags = case_flags.len(),
            "sync engines ready"
        );
        bus.emit(APP_READY, Payload::Empty);

        Self {
            bus,
            remote,
            completions,
            flags,
            case_flags,
        }
    }

    /// The shared event bus.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The shared remote adapter.
    #[must_use]
    pub fn remote(&self) -> &Arc<RemoteStore> {
        &self.remote
    }

    /// Engine for completion records.
    #[must_use]
    pub fn completions(&self) -> &SyncEngine<Completion> {
        &self.completions
    }

    /// Engine for question flags.
    #[must_use]
    pub fn flags(&self) -> &SyncEngine<QuestionFlag> {
        &self.flags
    }

    /// Engine for case flags.
    #[must_use]
    pub fn case_flags(&self) -> &SyncEngine<CaseFlag> {
        &self.case_flags
    }

    /// Publish a signed-in identity; every engine starts reconciling.
    pub fn sign_in(&self, identity: Identity) {
        self.remote.set_identity(Some(identity));
    }

    /// Publish sign-out; every engine discards its local records.
    pub fn sign_out(&self) {
        self.remote.set_identity(None);
    }

    /// Combined question and case flag counts.
    #[must_use]
    pub fn flag_stats(&self) -> FlagStats {
        FlagStats::collect(&self.flags, &self.case_flags)
    }

    /// Export every domain into one backup document.
    #[must_use]
    pub fn export_backup(&self) -> Backup {
        Backup {
            version: SNAPSHOT_VERSION.to_string(),
            exported_at: current_timestamp_ms(),
            completions: Some(self.completions.snapshot()),
            flags: Some(self.flags.snapshot()),
            case_flags: Some(self.case_flags.snapshot()),
        }
    }

    /// Merge a backup into every domain it covers.
    ///
    /// All sections are validated before any is applied, so a bad section
    /// leaves every domain untouched.
    ///
    /// # Errors
    ///
    /// [`ImportError::MissingSection`] when the backup covers no domain, or
    /// any validation error of [`Snapshot::validate`].
    pub fn import_backup(&self, backup: Backup) -> Result<BackupSummary, ImportError> {
        if backup.completions.is_none() && backup.flags.is_none() && backup.case_flags.is_none() {
            return Err(ImportError::MissingSection("completions, flags or caseFlags"));
        }

        let completions = section(&backup.version, backup.exported_at, backup.completions);
        let flags = section(&backup.version, backup.exported_at, backup.flags);
        let case_flags = section(&backup.version, backup.exported_at, backup.case_flags);

        for result in [
            completions.as_ref().map(Snapshot::validate),
            flags.as_ref().map(Snapshot::validate),
            case_flags.as_ref().map(Snapshot::validate),
        ]
        .into_iter()
        .flatten()
        {
            result?;
        }

        Ok(BackupSummary {
            completions: completions
                .map(|s| self.completions.import(s))
                .transpose()?,
            flags: flags.map(|s| self.flags.import(s)).transpose()?,
            case_flags: case_flags.map(|s| self.case_flags.import(s)).transpose()?,
        })
    }

    /// Parse a JSON backup and [`import_backup`](Coordinator::import_backup) it.
    ///
    /// # Errors
    ///
    /// [`ImportError::Malformed`] if `json` does not parse, otherwise as
    /// [`Coordinator::import_backup`].
    pub fn import_backup_json(&self, json: &str) -> Result<BackupSummary, ImportError> {
        let backup: Backup = serde_json::from_str(json)?;
        self.import_backup(backup)
    }

    /// Wait for every engine's in-flight remote work.
    pub async fn flush(&self) {
        futures::join!(
            self.completions.flush(),
            self.flags.flush(),
            self.case_flags.flush()
        );
    }
}

fn section<F>(version: &str, exported_at: u64, records: Option<RecordMap<F>>) -> Option<Snapshot<F>> {
    records.map(|records| Snapshot {
        version: version.to_string(),
        exported_at,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_emits_app_ready_once() {
        let coordinator = Coordinator::new(&SyncConfig::default(), None).expect("coordinator");
        let ready: Vec<_> = coordinator
            .bus()
            .history(100)
            .into_iter()
            .filter(|entry| entry.topic == APP_READY)
            .collect();
        assert_eq!(ready.len(), 1);
        assert!(!coordinator.remote().is_ready());
    }

    #[test]
    fn test_domains_are_isolated() {
        let coordinator = Coordinator::new(&SyncConfig::default(), None).expect("coordinator");
        coordinator
            .completions()
            .set_record("1_1", CompletionFields {});
        coordinator.case_flags().set_record("2_2", CaseFlagFields {});

        assert!(coordinator.completions().has("1_1"));
        assert!(!coordinator.case_flags().has("1_1"));
        assert!(coordinator.flags().is_empty());
        assert_eq!(coordinator.flag_stats().total, 1);
    }

    #[test]
    fn test_file_backed_mirrors_survive_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SyncConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..SyncConfig::default()
        };
        {
            let coordinator = Coordinator::new(&config, None).expect("coordinator");
            coordinator.completions().set_record("a", CompletionFields {});
            coordinator.flags().flag_question("a", 1, "why?");
        }
        let coordinator = Coordinator::new(&config, None).expect("reopen");
        assert!(coordinator.completions().has("a"));
        assert!(coordinator.flags().is_question_flagged("a", 1));
    }

    #[test]
    fn test_backup_round_trip() {
        let source = Coordinator::new(&SyncConfig::default(), None).expect("source");
        source.completions().set_record("1_1", CompletionFields {});
        source.flags().flag_question("1_1", 3, "text");
        source.case_flags().set_record("1_1", CaseFlagFields {});
        let json = serde_json::to_string(&source.export_backup()).expect("serialize");

        let target = Coordinator::new(&SyncConfig::default(), None).expect("target");
        let summary = target.import_backup_json(&json).expect("import");
        assert_eq!(summary.completions.map(|s| s.imported), Some(1));
        assert_eq!(target.completions().snapshot(), source.completions().snapshot());
        assert_eq!(target.flags().snapshot(), source.flags().snapshot());
        assert_eq!(target.case_flags().snapshot(), source.case_flags().snapshot());
    }

    #[test]
    fn test_backup_partial_sections() {
        let coordinator = Coordinator::new(&SyncConfig::default(), None).expect("coordinator");
        coordinator.completions().set_record("keep", CompletionFields {});
        let summary = coordinator
            .import_backup_json(r#"{"version": "1.0", "caseFlags": {"9_9": {"createdAt": 1}}}"#)
            .expect("import");
        assert!(summary.completions.is_none());
        assert_eq!(summary.case_flags.map(|s| s.total), Some(1));
        assert!(coordinator.completions().has("keep"));
    }

    #[test]
    fn test_backup_without_sections_is_rejected() {
        let coordinator = Coordinator::new(&SyncConfig::default(), None).expect("coordinator");
        let err = coordinator
            .import_backup_json(r#"{"version": "1.0"}"#)
            .unwrap_err();
        assert!(matches!(err, ImportError::MissingSection(_)));
    }

    #[test]
    fn test_invalid_section_blocks_every_domain() {
        let coordinator = Coordinator::new(&SyncConfig::default(), None).expect("coordinator");
        let err = coordinator
            .import_backup_json(
                r#"{"version": "1.0",
                    "completions": {"a": {"createdAt": 1}},
                    "caseFlags": {"": {"createdAt": 2}}}"#,
            )
            .unwrap_err();
        assert!(matches!(err, ImportError::InvalidSubject(_)));
        assert!(coordinator.completions().is_empty());
        assert!(coordinator.case_flags().is_empty());
    }

    #[test]
    fn test_backup_version_checked() {
        let coordinator = Coordinator::new(&SyncConfig::default(), None).expect("coordinator");
        let err = coordinator
            .import_backup_json(r#"{"version": "2.0", "completions": {}}"#)
            .unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedVersion(_)));
    }
}
