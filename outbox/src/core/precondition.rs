//! Precondition gate for moving an issue into active work.
//!
//! Evaluation is pure: dependency status is resolved by the caller and passed
//! in as a map, so the gate never touches the store.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::core::labels::NEEDS_HUMAN;
use crate::core::types::{Issue, IssueRef, ResultCode, WorkState};

static DEPENDS_ON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*(?:[-*]\s*)?DependsOn:\s*(.*)$").expect("valid DependsOn regex")
});

/// Why an issue may not enter the requested state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("issue is not claimed (no assignee)")]
    IssueNotClaimed,
    #[error("issue carries '{0}'")]
    NeedsHuman(String),
    #[error("unresolved dependencies: {}", .0.join(", "))]
    DependsUnresolved(Vec<String>),
}

impl PreconditionError {
    /// ResultCode recorded on the blocked transition.
    pub fn result_code(&self) -> ResultCode {
        match self {
            PreconditionError::IssueNotClaimed | PreconditionError::NeedsHuman(_) => {
                ResultCode::ManualIntervention
            }
            PreconditionError::DependsUnresolved(_) => ResultCode::DepUnresolved,
        }
    }

    /// Entries for the `BlockedBy` field.
    pub fn blocked_by(&self) -> Vec<String> {
        match self {
            PreconditionError::IssueNotClaimed => vec!["unclaimed".to_string()],
            PreconditionError::NeedsHuman(label) => vec![label.clone()],
            PreconditionError::DependsUnresolved(refs) => refs.clone(),
        }
    }
}

/// One `DependsOn:` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyRef {
    Local(IssueRef),
    /// Not auto-verified; treated as satisfied externally.
    External(String),
}

/// Parse every `DependsOn:` reference in an issue body, in order, deduplicated.
pub fn parse_depends_on(body: &str) -> Vec<DependencyRef> {
    let mut refs = Vec::new();
    for captures in DEPENDS_ON.captures_iter(body) {
        let Some(list) = captures.get(1) else {
            continue;
        };
        for raw in list
            .as_str()
            .split(|ch: char| ch == ',' || ch.is_whitespace())
            .map(str::trim)
            .filter(|raw| !raw.is_empty() && !raw.eq_ignore_ascii_case("none"))
        {
            let dep = match IssueRef::parse_local(raw) {
                Some(issue) => DependencyRef::Local(issue),
                None => DependencyRef::External(raw.to_string()),
            };
            if !refs.contains(&dep) {
                refs.push(dep);
            }
        }
    }
    refs
}

/// Local issue refs a body depends on.
pub fn local_dependencies(body: &str) -> Vec<IssueRef> {
    parse_depends_on(body)
        .into_iter()
        .filter_map(|dep| match dep {
            DependencyRef::Local(issue) => Some(issue),
            DependencyRef::External(_) => None,
        })
        .collect()
}

/// Local dependencies that are not known to be closed.
///
/// `closed` maps each resolvable local ref to its closed flag; a ref missing
/// from the map (unknown issue) counts as unresolved.
pub fn unresolved_dependencies(body: &str, closed: &BTreeMap<IssueRef, bool>) -> Vec<String> {
    local_dependencies(body)
        .into_iter()
        .filter(|issue| !closed.get(issue).copied().unwrap_or(false))
        .map(|issue| issue.to_string())
        .collect()
}

/// Check claim, needs-human and dependency rules, in that order.
///
/// Only enforced for `doing`, `review` and `done` targets.
pub fn ensure_work_preconditions(
    issue: &Issue,
    target: WorkState,
    closed: &BTreeMap<IssueRef, bool>,
) -> Result<(), PreconditionError> {
    if !matches!(
        target,
        WorkState::Doing | WorkState::Review | WorkState::Done
    ) {
        return Ok(());
    }
    if issue
        .assignee
        .as_deref()
        .is_none_or(|assignee| assignee.trim().is_empty())
    {
        return Err(PreconditionError::IssueNotClaimed);
    }
    if issue.has_label(NEEDS_HUMAN) {
        return Err(PreconditionError::NeedsHuman(NEEDS_HUMAN.to_string()));
    }
    let unresolved = unresolved_dependencies(&issue.body, closed);
    if !unresolved.is_empty() {
        return Err(PreconditionError::DependsUnresolved(unresolved));
    }
    Ok(())
}
