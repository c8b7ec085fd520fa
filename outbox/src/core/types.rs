//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between components and across the
//! worker process boundary. They do not touch external state.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, invalid};

/// Label set attached to one issue. Ordered for deterministic output.
pub type LabelSet = BTreeSet<String>;

/// Worker role. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Backend,
    Frontend,
    Qa,
    Reviewer,
    Integrator,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Backend,
        Role::Frontend,
        Role::Qa,
        Role::Reviewer,
        Role::Integrator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Backend => "backend",
            Role::Frontend => "frontend",
            Role::Qa => "qa",
            Role::Reviewer => "reviewer",
            Role::Integrator => "integrator",
        }
    }

    /// Default actor name the sync loop drives issues for.
    pub fn lead_actor(self) -> String {
        format!("lead-{}", self.as_str())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == raw.trim())
            .ok_or_else(|| ValidationError::new(format!("unknown role '{}'", raw.trim())))
    }
}

/// Stable local issue identifier, rendered as `local#<n>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IssueRef(pub i64);

impl IssueRef {
    pub const PREFIX: &'static str = "local#";

    pub fn id(self) -> i64 {
        self.0
    }

    /// Parse `local#<n>`. Anything else is not a local reference.
    pub fn parse_local(raw: &str) -> Option<Self> {
        let digits = raw.trim().strip_prefix(Self::PREFIX)?;
        let id: i64 = digits.parse().ok()?;
        (id > 0).then_some(IssueRef(id))
    }
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

impl FromStr for IssueRef {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        IssueRef::parse_local(raw).ok_or_else(|| {
            ValidationError::new(format!(
                "invalid issue ref '{}' (expected local#<n>)",
                raw.trim()
            ))
        })
    }
}

/// Workflow state carried by the singleton `state:*` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkState {
    Todo,
    Doing,
    Blocked,
    Review,
    Done,
}

impl WorkState {
    pub const LABEL_PREFIX: &'static str = "state:";

    pub fn as_str(self) -> &'static str {
        match self {
            WorkState::Todo => "todo",
            WorkState::Doing => "doing",
            WorkState::Blocked => "blocked",
            WorkState::Review => "review",
            WorkState::Done => "done",
        }
    }

    pub fn label(self) -> String {
        format!("{}{}", Self::LABEL_PREFIX, self.as_str())
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.strip_prefix(Self::LABEL_PREFIX)? {
            "todo" => Some(WorkState::Todo),
            "doing" => Some(WorkState::Doing),
            "blocked" => Some(WorkState::Blocked),
            "review" => Some(WorkState::Review),
            "done" => Some(WorkState::Done),
            _ => None,
        }
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkState {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let label = if raw.starts_with(Self::LABEL_PREFIX) {
            raw.to_string()
        } else {
            format!("{}{raw}", Self::LABEL_PREFIX)
        };
        WorkState::from_label(&label)
            .ok_or_else(|| ValidationError::new(format!("unknown state '{raw}'")))
    }
}

/// Closed failure classification attached to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    DepUnresolved,
    TestFailed,
    CiFailed,
    ReviewChangesRequested,
    EnvUnavailable,
    PermissionDenied,
    OutputUnparseable,
    StaleRun,
    ManualIntervention,
}

impl ResultCode {
    pub const ALL: [ResultCode; 9] = [
        ResultCode::DepUnresolved,
        ResultCode::TestFailed,
        ResultCode::CiFailed,
        ResultCode::ReviewChangesRequested,
        ResultCode::EnvUnavailable,
        ResultCode::PermissionDenied,
        ResultCode::OutputUnparseable,
        ResultCode::StaleRun,
        ResultCode::ManualIntervention,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::DepUnresolved => "dep_unresolved",
            ResultCode::TestFailed => "test_failed",
            ResultCode::CiFailed => "ci_failed",
            ResultCode::ReviewChangesRequested => "review_changes_requested",
            ResultCode::EnvUnavailable => "env_unavailable",
            ResultCode::PermissionDenied => "permission_denied",
            ResultCode::OutputUnparseable => "output_unparseable",
            ResultCode::StaleRun => "stale_run",
            ResultCode::ManualIntervention => "manual_intervention",
        }
    }

    /// Parse an optional code. Empty, `none` and `n/a` mean "no code";
    /// anything outside the closed set is a validation error.
    pub fn parse_optional(raw: &str) -> anyhow::Result<Option<ResultCode>> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.eq_ignore_ascii_case("none")
            || trimmed.eq_ignore_ascii_case("n/a")
        {
            return Ok(None);
        }
        ResultCode::ALL
            .into_iter()
            .find(|code| code.as_str() == trimmed)
            .map(Some)
            .ok_or_else(|| invalid!("invalid ResultCode '{trimmed}'"))
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Issue snapshot with its label set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub issue_ref: IssueRef,
    pub title: String,
    pub body: String,
    pub assignee: Option<String>,
    pub closed: bool,
    pub created_at: String,
    pub updated_at: String,
    pub closed_at: Option<String>,
    pub labels: LabelSet,
}

impl Issue {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn state(&self) -> Option<WorkState> {
        self.labels
            .iter()
            .find_map(|label| WorkState::from_label(label))
    }
}

/// Append-only timeline entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: i64,
    pub issue_ref: IssueRef,
    pub actor: String,
    pub body: String,
    pub created_at: String,
}

/// Change evidence reported by a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changes {
    #[serde(rename = "PR", alias = "pr", default)]
    pub pr: String,
    #[serde(rename = "Commit", alias = "commit", default)]
    pub commit: String,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.pr.trim().is_empty() && self.commit.trim().is_empty()
    }
}

/// Test evidence reported by a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    #[serde(rename = "Command", alias = "command", default)]
    pub command: String,
    #[serde(rename = "Result", alias = "result", default)]
    pub result: String,
    #[serde(rename = "Evidence", alias = "evidence", default)]
    pub evidence: String,
}

/// Task handed to a worker process (`work_order.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    #[serde(rename = "IssueRef", alias = "issue_ref")]
    pub issue_ref: String,
    #[serde(rename = "RunID", alias = "run_id")]
    pub run_id: String,
    #[serde(rename = "Role", alias = "role")]
    pub role: Role,
    #[serde(rename = "RepoDir", alias = "repo_dir")]
    pub repo_dir: String,
}

/// Result envelope a worker reports back.
///
/// `issue_ref` and `run_id` must echo the work order verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkResult {
    #[serde(rename = "IssueRef")]
    pub issue_ref: String,
    #[serde(rename = "RunID")]
    pub run_id: String,
    #[serde(rename = "Changes")]
    pub changes: Changes,
    #[serde(rename = "Tests")]
    pub tests: TestReport,
    #[serde(rename = "ResultCode")]
    pub result_code: Option<ResultCode>,
}

impl WorkResult {
    /// True when the result carries neither change nor test evidence.
    pub fn missing_evidence(&self) -> bool {
        self.changes.is_empty() && self.tests.result.trim().is_empty()
    }
}

/// Format a run identifier: `<date>-<role>-<seq>`.
pub fn format_run_id(date: &str, role: Role, seq: u64) -> String {
    format!("{date}-{role}-{seq}")
}
