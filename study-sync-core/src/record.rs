//! Record model shared by every sync domain.
//!
//! A record marks a subject (a study item, or an item plus sub-item) as done or
//! flagged. Presence in a domain's map means "yes"; absence means "no". The
//! three domains share one record shape and differ only in their extra fields.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Key identifying what a record is about.
pub type SubjectId = String;

/// Ordered map of records, as held in memory and mirrored locally.
pub type RecordMap<F> = BTreeMap<SubjectId, Record<F>>;

/// Separator between a case id and a question number in a question flag id.
pub const FLAG_SEPARATOR: &str = "_q";

/// A timestamped marker for one subject, plus domain-specific fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record<F> {
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Domain-specific fields, flattened next to `createdAt`.
    #[serde(flatten)]
    pub fields: F,
}

impl<F> Record<F> {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(fields: F) -> Self {
        Self {
            created_at: current_timestamp_ms(),
            fields,
        }
    }

    /// Create a record with an explicit timestamp.
    #[must_use]
    pub const fn at(created_at: u64, fields: F) -> Self {
        Self { created_at, fields }
    }
}

/// A record category that runs on its own engine instance.
///
/// Domains never share data; each has its own local mirror key and remote
/// collection.
pub trait Domain: Send + Sync + 'static {
    /// Extra fields stored next to the creation timestamp.
    type Fields: Clone
        + fmt::Debug
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Topic prefix for events emitted by this domain.
    const NAME: &'static str;
    /// Key of the local mirror document.
    const STORAGE_KEY: &'static str;
    /// Remote collection holding this domain's documents.
    const COLLECTION: &'static str;
}

/// Completed study items. Subject id is the item id.
#[derive(Debug, Clone, Copy)]
pub struct Completion;

/// Fields of a completion record (none besides the timestamp).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionFields {}

impl Domain for Completion {
    type Fields = CompletionFields;
    const NAME: &'static str = "completion";
    const STORAGE_KEY: &'static str = "completed_cases";
    const COLLECTION: &'static str = "progress";
}

/// Flagged questions. Subject id is `<caseId>_q<questionNumber>`.
#[derive(Debug, Clone, Copy)]
pub struct QuestionFlag;

/// Fields of a question flag record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionFlagFields {
    /// Case the question belongs to.
    pub case_id: String,
    /// Question number within the case.
    pub question_number: u32,
    /// Free-text label captured when the flag was set.
    #[serde(default)]
    pub question_text: String,
}

impl Domain for QuestionFlag {
    type Fields = QuestionFlagFields;
    const NAME: &'static str = "flag";
    const STORAGE_KEY: &'static str = "flagged_questions";
    const COLLECTION: &'static str = "flags";
}

/// Flagged cases. Subject id is the case id alone.
#[derive(Debug, Clone, Copy)]
pub struct CaseFlag;

/// Fields of a case flag record (none besides the timestamp).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFlagFields {}

impl Domain for CaseFlag {
    type Fields = CaseFlagFields;
    const NAME: &'static str = "case-flag";
    const STORAGE_KEY: &'static str = "flagged_cases";
    const COLLECTION: &'static str = "caseFlags";
}

/// Composite key of a question flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlagId {
    /// Case the question belongs to.
    pub case_id: String,
    /// Question number within the case.
    pub question_number: u32,
}

impl FlagId {
    /// Build a flag id from its parts.
    #[must_use]
    pub fn new(case_id: impl Into<String>, question_number: u32) -> Self {
        Self {
            case_id: case_id.into(),
            question_number,
        }
    }

    /// Parse a subject id of the form `<caseId>_q<questionNumber>`.
    ///
    /// The last separator wins, so case ids may themselves contain `_q`.
    #[must_use]
    pub fn parse(subject_id: &str) -> Option<Self> {
        let (case_id, number) = subject_id.rsplit_once(FLAG_SEPARATOR)?;
        if case_id.is_empty() {
            return None;
        }
        let question_number = number.parse().ok()?;
        Some(Self::new(case_id, question_number))
    }

    /// The subject id under which this flag is stored.
    #[must_use]
    pub fn subject_id(&self) -> SubjectId {
        self.to_string()
    }
}

impl fmt::Display for FlagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{FLAG_SEPARATOR}{}", self.case_id, self.question_number)
    }
}

/// Stats snapshot attached to mutation events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Number of records currently held by the domain.
    pub total: usize,
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| {
        // Timestamp will not exceed u64 max for millennia
        #[allow(clippy::cast_possible_truncation)]
        {
            d.as_millis() as u64
        }
    })
}
