//! Reserved label vocabulary and label-derived routing.

use crate::core::types::{LabelSet, Role, WorkState};

/// Hard stop for automation.
pub const NEEDS_HUMAN: &str = "needs-human";
/// Per-issue opt-out from the sync loop.
pub const AUTOFLOW_OFF: &str = "autoflow:off";
pub const REVIEW_APPROVED: &str = "review:approved";
pub const REVIEW_CHANGES_REQUESTED: &str = "review:changes_requested";
pub const QA_PASS: &str = "qa:pass";
pub const QA_FAIL: &str = "qa:fail";
/// Issues of this kind must carry Goal and Acceptance Criteria sections.
pub const KIND_TASK: &str = "kind:task";
/// Routing tag prefix, e.g. `to:backend`.
pub const ROUTE_PREFIX: &str = "to:";

pub fn route_label(role: Role) -> String {
    format!("{ROUTE_PREFIX}{role}")
}

/// Every state label present (the singleton invariant allows at most one).
pub fn state_labels(labels: &LabelSet) -> Vec<&str> {
    labels
        .iter()
        .filter(|label| label.starts_with(WorkState::LABEL_PREFIX))
        .map(String::as_str)
        .collect()
}

/// Roles named by `to:*` labels, in label order.
pub fn routed_roles(labels: &LabelSet) -> Vec<Role> {
    labels
        .iter()
        .filter_map(|label| label.strip_prefix(ROUTE_PREFIX))
        .filter_map(|raw| raw.parse().ok())
        .collect()
}

/// Coding role that receives review feedback or a failing CI signal.
///
/// Precedence is backend, then frontend, then qa; backend when no routing tag
/// names any of them.
pub fn next_role_for_review_changes(labels: &LabelSet) -> Role {
    let routed = routed_roles(labels);
    [Role::Backend, Role::Frontend, Role::Qa]
        .into_iter()
        .find(|role| routed.contains(role))
        .unwrap_or(Role::Backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> LabelSet {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn review_changes_prefer_backend() {
        let set = labels(&["to:qa", "to:frontend", "to:backend"]);
        assert_eq!(next_role_for_review_changes(&set), Role::Backend);
    }

    #[test]
    fn review_changes_fall_through_frontend_then_qa() {
        assert_eq!(
            next_role_for_review_changes(&labels(&["to:qa", "to:frontend"])),
            Role::Frontend
        );
        assert_eq!(
            next_role_for_review_changes(&labels(&["to:qa", "to:reviewer"])),
            Role::Qa
        );
    }

    #[test]
    fn review_changes_default_to_backend() {
        assert_eq!(
            next_role_for_review_changes(&labels(&["to:reviewer", "kind:task"])),
            Role::Backend
        );
        assert_eq!(next_role_for_review_changes(&LabelSet::new()), Role::Backend);
    }

    #[test]
    fn routed_roles_ignore_unknown_targets() {
        let set = labels(&["to:backend", "to:ops", "state:todo"]);
        assert_eq!(routed_roles(&set), vec![Role::Backend]);
    }
}
