//! Read-only merge readiness check.

use crate::core::labels::{NEEDS_HUMAN, QA_PASS, REVIEW_APPROVED};
use crate::core::types::LabelSet;

/// Outcome of the merge gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeReadiness {
    pub ready: bool,
    /// First failing condition, or `"ready"`.
    pub reason: &'static str,
}

/// Ready iff `needs-human` is absent and both `review:approved` and `qa:pass`
/// are present. Conditions are checked in that order.
pub fn can_merge(labels: &LabelSet) -> MergeReadiness {
    let reason = if labels.contains(NEEDS_HUMAN) {
        "needs-human present"
    } else if !labels.contains(REVIEW_APPROVED) {
        "missing review:approved"
    } else if !labels.contains(QA_PASS) {
        "missing qa:pass"
    } else {
        return MergeReadiness {
            ready: true,
            reason: "ready",
        };
    };
    MergeReadiness {
        ready: false,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> LabelSet {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn qa_pass_alone_is_missing_review() {
        let readiness = can_merge(&labels(&["qa:pass"]));
        assert!(!readiness.ready);
        assert_eq!(readiness.reason, "missing review:approved");
    }

    #[test]
    fn review_alone_is_missing_qa() {
        let readiness = can_merge(&labels(&["review:approved", "state:review"]));
        assert_eq!(readiness.reason, "missing qa:pass");
    }

    #[test]
    fn needs_human_is_reported_first() {
        let readiness = can_merge(&labels(&["needs-human", "qa:pass", "review:approved"]));
        assert!(!readiness.ready);
        assert_eq!(readiness.reason, "needs-human present");
    }

    #[test]
    fn both_signals_without_needs_human_are_ready() {
        let readiness = can_merge(&labels(&["qa:pass", "review:approved"]));
        assert!(readiness.ready);
        assert_eq!(readiness.reason, "ready");
    }
}
