//! Structured comment protocol: the canonical audit record every writer emits.
//!
//! The record is plain text with a fixed field list. Every field is rendered,
//! empty values as `none`, so readers can rely on the layout:
//!
//! ```text
//! Role: backend
//! Repo: main
//! IssueRef: local#4
//! RunId: 20261016-backend-1
//! Action: complete
//! Status: review
//! ResultCode: none
//! ReadUpTo: e12
//! Trigger: sync
//! Summary: ready for review/merge
//! Changes:
//!   PR: none
//!   Commit: git:abc123
//! Tests:
//!   Command: go test ./...
//!   Result: pass
//!   Evidence: none
//! BlockedBy: none
//! OpenQuestions: none
//! Next: reviewer
//! ```

use anyhow::Result;

use crate::core::types::{Changes, ResultCode, TestReport};
use crate::error::invalid;

const NONE: &str = "none";

/// Canonical audit record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredComment {
    pub role: String,
    pub repo: String,
    pub issue_ref: String,
    pub run_id: String,
    pub action: String,
    pub status: String,
    pub result_code: Option<ResultCode>,
    pub read_up_to: String,
    pub trigger: String,
    pub summary: String,
    pub changes: Changes,
    pub tests: TestReport,
    pub blocked_by: Vec<String>,
    pub open_questions: Vec<String>,
    pub next: String,
}

impl StructuredComment {
    /// True when the record carries change evidence and a test result.
    pub fn has_evidence(&self) -> bool {
        !self.changes.is_empty() && !self.tests.result.trim().is_empty()
    }

    pub fn render(&self) -> String {
        let mut buf = String::new();
        push_field(&mut buf, "", "Role", &self.role);
        push_field(&mut buf, "", "Repo", &self.repo);
        push_field(&mut buf, "", "IssueRef", &self.issue_ref);
        push_field(&mut buf, "", "RunId", &self.run_id);
        push_field(&mut buf, "", "Action", &self.action);
        push_field(&mut buf, "", "Status", &self.status);
        push_field(
            &mut buf,
            "",
            "ResultCode",
            self.result_code.map(ResultCode::as_str).unwrap_or(""),
        );
        push_field(&mut buf, "", "ReadUpTo", &self.read_up_to);
        push_field(&mut buf, "", "Trigger", &self.trigger);
        push_multiline(&mut buf, "Summary", &self.summary);
        buf.push_str("Changes:\n");
        push_field(&mut buf, "  ", "PR", &self.changes.pr);
        push_field(&mut buf, "  ", "Commit", &self.changes.commit);
        buf.push_str("Tests:\n");
        push_field(&mut buf, "  ", "Command", &self.tests.command);
        push_field(&mut buf, "  ", "Result", &self.tests.result);
        push_field(&mut buf, "  ", "Evidence", &self.tests.evidence);
        push_field(&mut buf, "", "BlockedBy", &self.blocked_by.join(", "));
        push_field(&mut buf, "", "OpenQuestions", &self.open_questions.join(", "));
        push_field(&mut buf, "", "Next", &self.next);
        buf
    }

    /// Parse a canonical record. The ResultCode must belong to the closed set.
    pub fn parse(text: &str) -> Result<Self> {
        if !is_canonical(text) {
            return Err(invalid!("comment is not a structured comment"));
        }
        let mut comment = StructuredComment::default();
        let mut section = Section::Top;
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("  ") {
                match section {
                    Section::Summary => {
                        comment.summary.push('\n');
                        comment.summary.push_str(rest);
                    }
                    Section::Changes => match split_field(rest) {
                        Some(("PR", value)) => comment.changes.pr = value,
                        Some(("Commit", value)) => comment.changes.commit = value,
                        _ => {}
                    },
                    Section::Tests => match split_field(rest) {
                        Some(("Command", value)) => comment.tests.command = value,
                        Some(("Result", value)) => comment.tests.result = value,
                        Some(("Evidence", value)) => comment.tests.evidence = value,
                        _ => {}
                    },
                    Section::Top => {}
                }
                continue;
            }
            let Some((key, value)) = split_field(line) else {
                continue;
            };
            section = Section::Top;
            match key {
                "Role" => comment.role = value,
                "Repo" => comment.repo = value,
                "IssueRef" => comment.issue_ref = value,
                "RunId" | "RunID" => comment.run_id = value,
                "Action" => comment.action = value,
                "Status" => comment.status = value,
                "ResultCode" => comment.result_code = ResultCode::parse_optional(&value)?,
                "ReadUpTo" => comment.read_up_to = value,
                "Trigger" => comment.trigger = value,
                "Summary" => {
                    comment.summary = value;
                    section = Section::Summary;
                }
                "Changes" => section = Section::Changes,
                "Tests" => section = Section::Tests,
                "BlockedBy" => comment.blocked_by = split_list(&value),
                "OpenQuestions" => comment.open_questions = split_list(&value),
                "Next" => comment.next = value,
                _ => {}
            }
        }
        Ok(comment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Top,
    Summary,
    Changes,
    Tests,
}

/// Detect the canonical shape by its required markers.
pub fn is_canonical(text: &str) -> bool {
    ["IssueRef:", "Changes:", "Tests:", "Next:"]
        .iter()
        .all(|marker| text.lines().any(|line| line.starts_with(marker)))
}

/// Fields used when free text is wrapped into a structured comment.
#[derive(Debug, Clone, Default)]
pub struct CommentDefaults {
    pub role: String,
    pub repo: String,
    pub issue_ref: String,
    pub run_id: String,
    pub status: String,
    pub read_up_to: String,
    pub trigger: String,
}

/// Return the canonical form of an incoming comment.
///
/// Canonical input is parsed (and its ResultCode validated); free text becomes
/// the Summary of a new record tagged `Action: update`.
pub fn normalize(text: &str, defaults: &CommentDefaults) -> Result<StructuredComment> {
    if is_canonical(text) {
        return StructuredComment::parse(text);
    }
    let summary = text.trim();
    if summary.is_empty() {
        return Err(invalid!("comment body is empty"));
    }
    Ok(StructuredComment {
        role: defaults.role.clone(),
        repo: defaults.repo.clone(),
        issue_ref: defaults.issue_ref.clone(),
        run_id: defaults.run_id.clone(),
        action: "update".to_string(),
        status: defaults.status.clone(),
        read_up_to: defaults.read_up_to.clone(),
        trigger: defaults.trigger.clone(),
        summary: summary.to_string(),
        ..StructuredComment::default()
    })
}

fn push_field(buf: &mut String, indent: &str, key: &str, value: &str) {
    buf.push_str(indent);
    buf.push_str(key);
    buf.push_str(": ");
    buf.push_str(or_none(value));
    buf.push('\n');
}

fn push_multiline(buf: &mut String, key: &str, value: &str) {
    let mut lines = value.trim().lines();
    let first = lines.next().unwrap_or("");
    push_field(buf, "", key, first);
    for line in lines {
        buf.push_str("  ");
        buf.push_str(line);
        buf.push('\n');
    }
}

fn or_none(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.is_empty() { NONE } else { trimmed }
}

fn split_field(line: &str) -> Option<(&str, String)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    let value = value.trim();
    let value = if value == NONE { "" } else { value };
    Some((key, value.to_string()))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty() && *item != NONE)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StructuredComment {
        StructuredComment {
            role: "backend".to_string(),
            repo: "main".to_string(),
            issue_ref: "local#4".to_string(),
            run_id: "20261016-backend-1".to_string(),
            action: "block".to_string(),
            status: "blocked".to_string(),
            result_code: Some(ResultCode::TestFailed),
            read_up_to: "e12".to_string(),
            trigger: "sync".to_string(),
            summary: "tests failed\nsee stdout.log".to_string(),
            changes: Changes {
                pr: String::new(),
                commit: "git:abc123".to_string(),
            },
            tests: TestReport {
                command: "go test ./...".to_string(),
                result: "fail".to_string(),
                evidence: "exit status 1".to_string(),
            },
            blocked_by: vec!["worker-result".to_string(), "needs-human".to_string()],
            open_questions: Vec::new(),
            next: "backend".to_string(),
        }
    }

    #[test]
    fn empty_fields_render_as_none() {
        let rendered = StructuredComment::default().render();
        for key in [
            "Role", "Repo", "IssueRef", "RunId", "Action", "Status", "ResultCode", "ReadUpTo",
            "Trigger", "Summary", "BlockedBy", "OpenQuestions", "Next",
        ] {
            assert!(
                rendered.contains(&format!("{key}: none\n")),
                "{key} should render as none"
            );
        }
        assert!(rendered.contains("Changes:\n  PR: none\n  Commit: none\n"));
        assert!(rendered.contains("Tests:\n  Command: none\n  Result: none\n  Evidence: none\n"));
    }

    #[test]
    fn rendered_comment_parses_back() {
        let comment = sample();
        let parsed = StructuredComment::parse(&comment.render()).expect("parse");
        assert_eq!(parsed, comment);
    }

    #[test]
    fn parse_rejects_out_of_enum_result_code() {
        let text = sample().render().replace("test_failed", "mostly_fine");
        let err = StructuredComment::parse(&text).unwrap_err();
        assert!(crate::error::is_validation(&err));
    }

    #[test]
    fn normalize_wraps_free_text_as_update() {
        let defaults = CommentDefaults {
            role: "qa".to_string(),
            issue_ref: "local#9".to_string(),
            ..CommentDefaults::default()
        };
        let comment = normalize("  looks good to me  ", &defaults).expect("normalize");
        assert_eq!(comment.action, "update");
        assert_eq!(comment.summary, "looks good to me");
        assert_eq!(comment.issue_ref, "local#9");
        assert!(!comment.has_evidence());
    }

    #[test]
    fn normalize_keeps_canonical_input() {
        let comment = sample();
        let normalized =
            normalize(&comment.render(), &CommentDefaults::default()).expect("normalize");
        assert_eq!(normalized, comment);
        assert!(normalized.has_evidence());
    }

    #[test]
    fn partial_markers_are_not_canonical() {
        assert!(!is_canonical("IssueRef: local#1\nChanges:\nTests:\n"));
        assert!(normalize("", &CommentDefaults::default()).is_err());
    }
}
