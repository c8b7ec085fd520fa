//! Deterministic classification of a validated worker result.

use crate::core::labels::next_role_for_review_changes;
use crate::core::types::{LabelSet, ResultCode, Role, WorkResult};

/// How a worker outcome is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Neither change nor test evidence; needs a human regardless of the
    /// worker-reported code.
    MissingEvidence,
    /// Reviewer asked for changes; hand back to the coding role.
    ChangesRequested { next: Role },
    /// Any other reported failure code.
    Failed(ResultCode),
    /// Ready for review/merge.
    Success,
}

impl Classification {
    /// ResultCode recorded on the comment.
    pub fn result_code(self) -> Option<ResultCode> {
        match self {
            Classification::MissingEvidence => Some(ResultCode::ManualIntervention),
            Classification::ChangesRequested { .. } => Some(ResultCode::ReviewChangesRequested),
            Classification::Failed(code) => Some(code),
            Classification::Success => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Classification::Success)
    }
}

/// Classify in fixed precedence: missing evidence, reviewer change request,
/// other failure code, success.
pub fn classify(role: Role, result: &WorkResult, labels: &LabelSet) -> Classification {
    if result.missing_evidence() {
        return Classification::MissingEvidence;
    }
    match result.result_code {
        Some(ResultCode::ReviewChangesRequested) if role == Role::Reviewer => {
            Classification::ChangesRequested {
                next: next_role_for_review_changes(labels),
            }
        }
        Some(code) => Classification::Failed(code),
        None => Classification::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(commit: &str, tests: &str, code: Option<ResultCode>) -> WorkResult {
        let mut result = WorkResult {
            issue_ref: "local#1".to_string(),
            run_id: "20261016-backend-1".to_string(),
            result_code: code,
            ..WorkResult::default()
        };
        result.changes.commit = commit.to_string();
        result.tests.result = tests.to_string();
        result
    }

    #[test]
    fn missing_evidence_overrides_reported_code() {
        let classification = classify(
            Role::Backend,
            &result("", "", Some(ResultCode::TestFailed)),
            &LabelSet::new(),
        );
        assert_eq!(classification, Classification::MissingEvidence);
        assert_eq!(
            classification.result_code(),
            Some(ResultCode::ManualIntervention)
        );
    }

    #[test]
    fn reviewer_change_request_routes_to_coding_role() {
        let labels: LabelSet = ["to:frontend".to_string()].into();
        let classification = classify(
            Role::Reviewer,
            &result("git:abc", "pass", Some(ResultCode::ReviewChangesRequested)),
            &labels,
        );
        assert_eq!(
            classification,
            Classification::ChangesRequested {
                next: Role::Frontend
            }
        );
    }

    #[test]
    fn change_request_from_non_reviewer_is_a_plain_failure() {
        let classification = classify(
            Role::Backend,
            &result("git:abc", "pass", Some(ResultCode::ReviewChangesRequested)),
            &LabelSet::new(),
        );
        assert_eq!(
            classification,
            Classification::Failed(ResultCode::ReviewChangesRequested)
        );
    }

    #[test]
    fn tests_only_evidence_without_code_is_success() {
        let classification = classify(Role::Qa, &result("", "pass", None), &LabelSet::new());
        assert!(classification.is_success());
        assert_eq!(classification.result_code(), None);
    }
}
