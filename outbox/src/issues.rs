//! Issue operations: create, claim, transition, comment, label and close.
//!
//! Each operation is one store transaction. Precondition failures are not
//! errors here: they are committed as a blocked transition with an audit
//! comment and reported back as [`Transition::Blocked`].

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::core::comment::{CommentDefaults, StructuredComment, normalize};
use crate::core::labels::KIND_TASK;
use crate::core::merge_gate::{MergeReadiness, can_merge};
use crate::core::precondition::{PreconditionError, ensure_work_preconditions, local_dependencies};
use crate::core::types::{Event, Issue, IssueRef, LabelSet, WorkState};
use crate::error::invalid;
use crate::io::store::{IssueStore, IssueTx};

static GOAL_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^\s*(?:#+\s*)?Goal\b").expect("valid goal regex"));
static ACCEPTANCE_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*(?:#+\s*)?Acceptance Criteria\b").expect("valid acceptance regex")
});

/// Result of a state change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied(WorkState),
    /// The gate refused; the issue is now `state:blocked` with a comment.
    Blocked(PreconditionError),
}

/// Closed flag for every local dependency named in `body`. Unknown refs are
/// left out and therefore count as unresolved.
pub fn dependency_status(tx: &dyn IssueTx, body: &str) -> Result<BTreeMap<IssueRef, bool>> {
    let mut closed = BTreeMap::new();
    for dep in local_dependencies(body) {
        if let Some(issue) = tx.find_issue(dep)? {
            closed.insert(dep, issue.closed);
        }
    }
    Ok(closed)
}

/// Set `state:blocked` and append the rendered comment.
pub fn block_with_comment(
    tx: &dyn IssueTx,
    issue: IssueRef,
    actor: &str,
    comment: &StructuredComment,
) -> Result<Event> {
    tx.set_state(issue, WorkState::Blocked)?;
    tx.append_event(issue, actor, &comment.render())
}

/// Audit comment for a refused transition.
pub fn precondition_comment(
    issue: &Issue,
    actor: &str,
    trigger: &str,
    err: &PreconditionError,
) -> StructuredComment {
    StructuredComment {
        role: actor.to_string(),
        issue_ref: issue.issue_ref.to_string(),
        action: "block".to_string(),
        status: WorkState::Blocked.to_string(),
        result_code: Some(err.result_code()),
        trigger: trigger.to_string(),
        summary: format!("precondition failed: {err}"),
        blocked_by: err.blocked_by(),
        next: match err {
            PreconditionError::DependsUnresolved(_) => "wait for dependencies".to_string(),
            _ => "human".to_string(),
        },
        ..StructuredComment::default()
    }
}

fn validate_new_issue(title: &str, body: &str, labels: &LabelSet) -> Result<()> {
    if title.trim().is_empty() {
        return Err(invalid!("issue title is required"));
    }
    let states = crate::core::labels::state_labels(labels);
    if states.len() > 1 {
        return Err(invalid!(
            "at most one state label allowed, got {}",
            states.join(", ")
        ));
    }
    if let Some(label) = states.first()
        && WorkState::from_label(label).is_none()
    {
        return Err(invalid!("unknown state label '{label}'"));
    }
    if labels.contains(KIND_TASK) {
        if !GOAL_SECTION.is_match(body) {
            return Err(invalid!("kind:task issues need a Goal section"));
        }
        if !ACCEPTANCE_SECTION.is_match(body) {
            return Err(invalid!("kind:task issues need an Acceptance Criteria section"));
        }
    }
    Ok(())
}

/// Create an issue; `state:todo` is added unless a state label is given.
#[instrument(skip_all, fields(title))]
pub fn create<S: IssueStore>(
    store: &S,
    title: &str,
    body: &str,
    labels: &[String],
) -> Result<Issue> {
    let mut labels: LabelSet = labels
        .iter()
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .collect();
    validate_new_issue(title, body, &labels)?;
    if crate::core::labels::state_labels(&labels).is_empty() {
        labels.insert(WorkState::Todo.label());
    }
    let issue = store.transaction(|tx| tx.create_issue(title.trim(), body, &labels))?;
    info!(issue = %issue.issue_ref, "issue created");
    Ok(issue)
}

/// Assign the issue to `actor`. Re-claiming by the owner is a no-op.
#[instrument(skip_all, fields(%issue, actor))]
pub fn claim<S: IssueStore>(store: &S, issue: IssueRef, actor: &str) -> Result<Issue> {
    let actor = actor.trim();
    if actor.is_empty() {
        return Err(invalid!("actor is required to claim {issue}"));
    }
    store.transaction(|tx| {
        let current = tx.issue(issue)?;
        match current.assignee.as_deref().map(str::trim) {
            Some(owner) if owner == actor => return Ok(current),
            Some(owner) if !owner.is_empty() => {
                return Err(invalid!("{issue} is already claimed by {owner}"));
            }
            _ => {}
        }
        tx.set_assignee(issue, Some(actor))?;
        tx.issue(issue)
    })
}

/// Move an issue to `target`, enforcing the precondition gate.
#[instrument(skip_all, fields(%issue, %target, actor))]
pub fn transition<S: IssueStore>(
    store: &S,
    issue: IssueRef,
    target: WorkState,
    actor: &str,
) -> Result<Transition> {
    store.transaction(|tx| {
        let current = tx.issue(issue)?;
        let deps = dependency_status(tx, &current.body)?;
        match ensure_work_preconditions(&current, target, &deps) {
            Ok(()) => {
                tx.set_state(issue, target)?;
                Ok(Transition::Applied(target))
            }
            Err(err) => {
                warn!(err = %err, "transition blocked");
                let comment = precondition_comment(&current, actor, "transition", &err);
                block_with_comment(tx, issue, actor, &comment)?;
                Ok(Transition::Blocked(err))
            }
        }
    })
}

/// Append a comment, normalizing free text into the canonical record.
#[instrument(skip_all, fields(%issue, actor))]
pub fn comment<S: IssueStore>(
    store: &S,
    issue: IssueRef,
    actor: &str,
    body: &str,
) -> Result<Event> {
    store.transaction(|tx| {
        let current = tx.issue(issue)?;
        let normalized = normalize(body, &defaults_for(&current, actor))?;
        tx.append_event(issue, actor, &normalized.render())
    })
}

/// Add a label. Adding a `state:*` label replaces the current one.
pub fn add_label<S: IssueStore>(store: &S, issue: IssueRef, label: &str) -> Result<Issue> {
    let label = label.trim();
    if label.is_empty() {
        return Err(invalid!("label is required"));
    }
    store.transaction(|tx| {
        if label.starts_with(WorkState::LABEL_PREFIX) {
            let state = WorkState::from_label(label)
                .ok_or_else(|| invalid!("unknown state label '{label}'"))?;
            tx.set_state(issue, state)?;
        } else {
            tx.add_label(issue, label)?;
        }
        tx.issue(issue)
    })
}

/// Remove a label. The state label can only be replaced, not removed.
pub fn remove_label<S: IssueStore>(store: &S, issue: IssueRef, label: &str) -> Result<Issue> {
    let label = label.trim();
    if label.starts_with(WorkState::LABEL_PREFIX) {
        return Err(invalid!("state labels are replaced, not removed"));
    }
    store.transaction(|tx| {
        tx.remove_label(issue, label)?;
        tx.issue(issue)
    })
}

/// Close an issue. Requires Changes+Tests evidence on the timeline or in the
/// inline comment, and the `done` preconditions.
#[instrument(skip_all, fields(%issue, actor))]
pub fn close<S: IssueStore>(
    store: &S,
    issue: IssueRef,
    actor: &str,
    inline: Option<&str>,
) -> Result<Transition> {
    store.transaction(|tx| {
        let current = tx.issue(issue)?;
        let inline = inline
            .map(|text| normalize(text, &defaults_for(&current, actor)))
            .transpose()?;
        let inline_evidence = inline.as_ref().is_some_and(StructuredComment::has_evidence);
        if !inline_evidence && !timeline_has_evidence(&tx.events(issue)?) {
            return Err(invalid!(
                "closing {issue} requires Changes and Tests evidence on the timeline or inline"
            ));
        }

        let deps = dependency_status(tx, &current.body)?;
        if let Err(err) = ensure_work_preconditions(&current, WorkState::Done, &deps) {
            warn!(err = %err, "close blocked");
            let comment = precondition_comment(&current, actor, "close", &err);
            block_with_comment(tx, issue, actor, &comment)?;
            return Ok(Transition::Blocked(err));
        }

        if let Some(inline) = inline {
            tx.append_event(issue, actor, &inline.render())?;
        }
        tx.set_state(issue, WorkState::Done)?;
        tx.close_issue(issue)?;
        info!("issue closed");
        Ok(Transition::Applied(WorkState::Done))
    })
}

/// Merge readiness from the issue's current labels.
pub fn merge_check<S: IssueStore>(store: &S, issue: IssueRef) -> Result<MergeReadiness> {
    let labels = store.read(|tx| Ok(tx.issue(issue)?.labels))?;
    Ok(can_merge(&labels))
}

fn timeline_has_evidence(events: &[Event]) -> bool {
    events.iter().any(|event| {
        StructuredComment::parse(&event.body).is_ok_and(|comment| comment.has_evidence())
    })
}

fn defaults_for(issue: &Issue, actor: &str) -> CommentDefaults {
    CommentDefaults {
        role: actor.to_string(),
        issue_ref: issue.issue_ref.to_string(),
        status: issue
            .state()
            .map(|state| state.to_string())
            .unwrap_or_default(),
        trigger: "manual".to_string(),
        ..CommentDefaults::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_validation;
    use crate::io::store::SqliteStore;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("store")
    }

    #[test]
    fn create_defaults_to_todo_and_rejects_two_states() {
        let store = store();
        let issue = create(&store, "t", "", &["to:backend".to_string()]).expect("create");
        assert_eq!(issue.state(), Some(WorkState::Todo));

        let err = create(
            &store,
            "t",
            "",
            &["state:todo".to_string(), "state:doing".to_string()],
        )
        .unwrap_err();
        assert!(is_validation(&err));
    }

    #[test]
    fn task_issues_need_goal_and_acceptance() {
        let store = store();
        let labels = vec!["kind:task".to_string()];
        let err = create(&store, "t", "## Goal\nship it", &labels).unwrap_err();
        assert!(err.to_string().contains("Acceptance Criteria"));
        create(
            &store,
            "t",
            "## Goal\nship it\n\n## Acceptance Criteria\n- works",
            &labels,
        )
        .expect("create");
    }

    #[test]
    fn claim_rejects_other_owner() {
        let store = store();
        let issue = create(&store, "t", "", &[]).expect("create").issue_ref;
        claim(&store, issue, "alice").expect("claim");
        claim(&store, issue, "alice").expect("reclaim is a no-op");
        let err = claim(&store, issue, "bob").unwrap_err();
        assert!(err.to_string().contains("already claimed by alice"));
    }

    #[test]
    fn unclaimed_transition_is_committed_as_blocked() {
        let store = store();
        let issue = create(&store, "t", "", &[]).expect("create").issue_ref;
        let outcome = transition(&store, issue, WorkState::Doing, "lead").expect("transition");
        assert_eq!(outcome, Transition::Blocked(PreconditionError::IssueNotClaimed));
        let (current, events) = store
            .read(|tx| Ok((tx.issue(issue)?, tx.events(issue)?)))
            .expect("read");
        assert_eq!(current.state(), Some(WorkState::Blocked));
        let comment = StructuredComment::parse(&events[0].body).expect("parse");
        assert_eq!(
            comment.result_code,
            Some(crate::core::types::ResultCode::ManualIntervention)
        );
    }

    #[test]
    fn open_dependency_blocks_with_dep_unresolved() {
        let store = store();
        let dep = create(&store, "dep", "", &[]).expect("create").issue_ref;
        let issue = create(&store, "t", &format!("DependsOn: {dep}"), &[])
            .expect("create")
            .issue_ref;
        claim(&store, issue, "alice").expect("claim");
        let outcome = transition(&store, issue, WorkState::Doing, "alice").expect("transition");
        assert_eq!(
            outcome,
            Transition::Blocked(PreconditionError::DependsUnresolved(vec![dep.to_string()]))
        );
    }

    #[test]
    fn free_text_comment_is_wrapped() {
        let store = store();
        let issue = create(&store, "t", "", &[]).expect("create").issue_ref;
        let event = comment(&store, issue, "alice", "ping").expect("comment");
        let parsed = StructuredComment::parse(&event.body).expect("parse");
        assert_eq!(parsed.action, "update");
        assert_eq!(parsed.summary, "ping");
        assert_eq!(parsed.status, "todo");
    }

    #[test]
    fn comment_with_invalid_result_code_is_rejected() {
        let store = store();
        let issue = create(&store, "t", "", &[]).expect("create").issue_ref;
        let body = StructuredComment {
            issue_ref: issue.to_string(),
            ..StructuredComment::default()
        }
        .render()
        .replace("ResultCode: none", "ResultCode: bogus");
        let err = comment(&store, issue, "alice", &body).unwrap_err();
        assert!(is_validation(&err));
        let events = store.read(|tx| tx.events(issue)).expect("events");
        assert!(events.is_empty());
    }

    #[test]
    fn adding_a_state_label_replaces_the_old_one() {
        let store = store();
        let issue = create(&store, "t", "", &[]).expect("create").issue_ref;
        let updated = add_label(&store, issue, "state:review").expect("label");
        assert_eq!(
            crate::core::labels::state_labels(&updated.labels),
            vec!["state:review"]
        );
        assert!(remove_label(&store, issue, "state:review").is_err());
    }

    #[test]
    fn merge_check_reads_labels() {
        let store = store();
        let issue = create(&store, "t", "", &["qa:pass".to_string()])
            .expect("create")
            .issue_ref;
        let readiness = merge_check(&store, issue).expect("check");
        assert!(!readiness.ready);
        assert_eq!(readiness.reason, "missing review:approved");
    }
}
