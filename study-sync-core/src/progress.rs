//! Progress statistics over an externally supplied roster.
//!
//! The engine never knows the universe of subjects. A [`Roster`] enumerates
//! the valid subject ids per category, and the statistics here are pure
//! functions of that roster and the engine's current map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::SubjectId;

/// Enumeration of valid subject ids per category.
pub trait Roster: Send + Sync {
    /// Every category, in display order.
    fn categories(&self) -> Vec<String>;

    /// Subject ids belonging to `category`. Unknown categories yield nothing.
    fn subjects(&self, category: &str) -> Vec<SubjectId>;

    /// Every subject id across all categories.
    fn all_subjects(&self) -> Vec<SubjectId> {
        self.categories()
            .iter()
            .flat_map(|category| self.subjects(category))
            .collect()
    }
}

/// Roster held in memory, loadable from `{"category": ["id", ...]}` JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticRoster {
    categories: BTreeMap<String, Vec<SubjectId>>,
}

impl StaticRoster {
    /// Create an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a category with its subjects, replacing any previous entry.
    #[must_use]
    pub fn with_category<I, S>(mut self, category: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubjectId>,
    {
        self.categories.insert(
            category.into(),
            subjects.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Parse a roster from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not an object of string arrays.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Roster for StaticRoster {
    fn categories(&self) -> Vec<String> {
        self.categories.keys().cloned().collect()
    }

    fn subjects(&self, category: &str) -> Vec<SubjectId> {
        self.categories.get(category).cloned().unwrap_or_default()
    }
}

/// Completion progress for a set of subjects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Number of subjects considered.
    pub total: usize,
    /// Number of those subjects that have a record.
    pub completed: usize,
    /// `completed / total` as a whole percentage, rounded half up; 0 when empty.
    pub percentage: u8,
}

impl Progress {
    /// Build a progress value from counts.
    #[must_use]
    pub fn new(completed: usize, total: usize) -> Self {
        let completed = completed.min(total);
        let percentage = if total == 0 {
            0
        } else {
            // Integer rounding: (200c + t) / 2t == round(100c / t)
            let scaled = (200 * completed + total) / (2 * total);
            u8::try_from(scaled).unwrap_or(100)
        };
        Self {
            total,
            completed,
            percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_rounding() {
        assert_eq!(Progress::new(0, 0).percentage, 0);
        assert_eq!(Progress::new(1, 3).percentage, 33);
        assert_eq!(Progress::new(2, 3).percentage, 67);
        assert_eq!(Progress::new(1, 2).percentage, 50);
        assert_eq!(Progress::new(1, 8).percentage, 13);
        assert_eq!(Progress::new(5, 5).percentage, 100);
    }

    #[test]
    fn test_progress_clamps_completed() {
        let progress = Progress::new(7, 5);
        assert_eq!(progress.completed, 5);
        assert_eq!(progress.percentage, 100);
    }

    #[test]
    fn test_static_roster_from_json() {
        let roster = StaticRoster::from_json(r#"{"cardio": ["1_1", "1_2"], "neuro": ["2_1"]}"#)
            .expect("parse");
        assert_eq!(roster.categories(), vec!["cardio", "neuro"]);
        assert_eq!(roster.subjects("cardio"), vec!["1_1", "1_2"]);
        assert!(roster.subjects("missing").is_empty());
        assert_eq!(roster.all_subjects().len(), 3);
    }

    #[test]
    fn test_static_roster_builder() {
        let roster = StaticRoster::new()
            .with_category("a", ["x"])
            .with_category("a", ["y", "z"]);
        assert_eq!(roster.subjects("a"), vec!["y", "z"]);
    }
}
