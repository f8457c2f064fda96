//! Question and case flag helpers on top of the generic engine.

use serde::{Deserialize, Serialize};

use crate::engine::SyncEngine;
use crate::record::{CaseFlag, FlagId, QuestionFlag, QuestionFlagFields, Record};

impl SyncEngine<QuestionFlag> {
    /// Flag question `question_number` of `case_id`, storing `question_text`.
    pub fn flag_question(
        &self,
        case_id: &str,
        question_number: u32,
        question_text: impl Into<String>,
    ) -> bool {
        let id = FlagId::new(case_id, question_number);
        self.set_record(
            &id.subject_id(),
            QuestionFlagFields {
                case_id: case_id.to_string(),
                question_number,
                question_text: question_text.into(),
            },
        )
    }

    /// Remove the flag on question `question_number` of `case_id`.
    pub fn unflag_question(&self, case_id: &str, question_number: u32) -> bool {
        self.clear_record(&FlagId::new(case_id, question_number).subject_id())
    }

    /// Flip the flag on a question. Returns whether it is flagged afterwards.
    pub fn toggle_question(
        &self,
        case_id: &str,
        question_number: u32,
        question_text: impl Into<String>,
    ) -> bool {
        if self.is_question_flagged(case_id, question_number) {
            self.unflag_question(case_id, question_number);
            false
        } else {
            self.flag_question(case_id, question_number, question_text)
        }
    }

    /// Whether question `question_number` of `case_id` is flagged.
    #[must_use]
    pub fn is_question_flagged(&self, case_id: &str, question_number: u32) -> bool {
        self.has(&FlagId::new(case_id, question_number).subject_id())
    }

    /// Flags belonging to `case_id`, ordered by question number.
    #[must_use]
    pub fn flags_for_case(&self, case_id: &str) -> Vec<(FlagId, Record<QuestionFlagFields>)> {
        let mut flags: Vec<_> = self
            .all()
            .into_iter()
            .filter_map(|(id, record)| {
                let flag = FlagId::parse(&id)?;
                (flag.case_id == case_id).then_some((flag, record))
            })
            .collect();
        flags.sort_by_key(|(flag, _)| flag.question_number);
        flags
    }

    /// Number of flagged questions in `case_id`.
    #[must_use]
    pub fn flagged_count_for_case(&self, case_id: &str) -> usize {
        self.count_where(|id| FlagId::parse(id).is_some_and(|flag| flag.case_id == case_id))
    }
}

/// Combined flag counts across the question and case domains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagStats {
    /// Flagged questions.
    pub question_flags: usize,
    /// Flagged cases.
    pub case_flags: usize,
    /// Sum of both.
    pub total: usize,
}

impl FlagStats {
    /// Count the flags currently held by both engines.
    #[must_use]
    pub fn collect(questions: &SyncEngine<QuestionFlag>, cases: &SyncEngine<CaseFlag>) -> Self {
        let question_flags = questions.len();
        let case_flags = cases.len();
        Self {
            question_flags,
            case_flags,
            total: question_flags + case_flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::event::EventBus;
    use crate::record::CaseFlagFields;
    use crate::remote::RemoteStore;
    use std::sync::Arc;

    fn engines() -> (SyncEngine<QuestionFlag>, SyncEngine<CaseFlag>) {
        let bus = EventBus::new();
        let remote = Arc::new(RemoteStore::new(bus.clone()));
        let cache = Arc::new(MemoryCache::new());
        (
            SyncEngine::start(cache.clone(), remote.clone(), bus.clone()),
            SyncEngine::start(cache, remote, bus),
        )
    }

    #[test]
    fn test_flag_and_unflag_question() {
        let (questions, _) = engines();
        assert!(questions.flag_question("1_1", 2, "Which artery?"));
        assert!(questions.is_question_flagged("1_1", 2));

        let record = questions.get("1_1_q2").expect("stored under composite id");
        assert_eq!(record.fields.question_text, "Which artery?");
        assert_eq!(record.fields.question_number, 2);

        assert!(questions.unflag_question("1_1", 2));
        assert!(!questions.is_question_flagged("1_1", 2));
    }

    #[test]
    fn test_toggle_question() {
        let (questions, _) = engines();
        assert!(questions.toggle_question("1_1", 1, "q"));
        assert!(!questions.toggle_question("1_1", 1, "q"));
        assert!(questions.is_empty());
    }

    #[test]
    fn test_flags_for_case_are_scoped_and_ordered() {
        let (questions, _) = engines();
        questions.flag_question("1_1", 10, "");
        questions.flag_question("1_1", 2, "");
        questions.flag_question("1_10", 1, "");

        let numbers: Vec<u32> = questions
            .flags_for_case("1_1")
            .into_iter()
            .map(|(flag, _)| flag.question_number)
            .collect();
        assert_eq!(numbers, vec![2, 10]);
        assert_eq!(questions.flagged_count_for_case("1_1"), 2);
        assert_eq!(questions.flagged_count_for_case("1_10"), 1);
        assert_eq!(questions.flagged_count_for_case("9_9"), 0);
    }

    #[test]
    fn test_flag_stats() {
        let (questions, cases) = engines();
        questions.flag_question("1_1", 1, "");
        questions.flag_question("1_1", 2, "");
        cases.set_record("1_1", CaseFlagFields {});

        let stats = FlagStats::collect(&questions, &cases);
        assert_eq!(
            stats,
            FlagStats {
                question_flags: 2,
                case_flags: 1,
                total: 3
            }
        );
        let json = serde_json::to_value(stats).expect("serialize");
        assert_eq!(json["questionFlags"], 2);
        assert_eq!(json["caseFlags"], 1);
    }
}
