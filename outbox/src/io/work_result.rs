//! Loading the result a worker left in its context pack.
//!
//! Formats are tried in a fixed order: `work_result.json`, then the legacy
//! `work_result.txt` header block, then a fallback built from the work order
//! when the worker wrote no result file at all.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::core::types::{Changes, ResultCode, TestReport, WorkOrder, WorkResult};
use crate::error::invalid;
use crate::io::context_pack::{ContextPack, STDOUT_LOG};
use crate::io::write_atomic;

/// Which source a result was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFormat {
    Json,
    Text,
    /// No result file; derived from the work order and stdout.log presence.
    Logs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedResult {
    pub format: ResultFormat,
    pub result: WorkResult,
}

/// Reads a worker result out of a context pack.
pub trait ResultLoader {
    fn load(&self, pack: &ContextPack, order: &WorkOrder) -> Result<LoadedResult>;
}

/// Loader over the context pack files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileResultLoader;

impl ResultLoader for FileResultLoader {
    #[instrument(skip_all, fields(pack = %pack.dir().display()))]
    fn load(&self, pack: &ContextPack, order: &WorkOrder) -> Result<LoadedResult> {
        let json = pack.work_result_json();
        if json.exists() {
            let contents = read(&json)?;
            let result = parse_json_result(&contents)
                .with_context(|| format!("parse {}", json.display()))?;
            debug!("loaded json result");
            return Ok(LoadedResult {
                format: ResultFormat::Json,
                result,
            });
        }
        let txt = pack.work_result_txt();
        if txt.exists() {
            let contents = read(&txt)?;
            let result = parse_text_result(&contents)
                .with_context(|| format!("parse {}", txt.display()))?;
            debug!("loaded legacy text result");
            return Ok(LoadedResult {
                format: ResultFormat::Text,
                result,
            });
        }
        if !pack.stdout_log().exists() {
            bail!(
                "no work result in {} and no {STDOUT_LOG} to fall back on",
                pack.dir().display()
            );
        }
        warn!("no result file, falling back to log presence");
        Ok(LoadedResult {
            format: ResultFormat::Logs,
            result: WorkResult {
                issue_ref: order.issue_ref.clone(),
                run_id: order.run_id.clone(),
                changes: Changes::default(),
                tests: TestReport {
                    command: String::new(),
                    result: "pass".to_string(),
                    evidence: STDOUT_LOG.to_string(),
                },
                result_code: None,
            },
        })
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

/// Canonical PascalCase shape; snake_case keys are accepted as the legacy form.
#[derive(Debug, Deserialize)]
struct RawWorkResult {
    #[serde(rename = "IssueRef", alias = "issue_ref", default)]
    issue_ref: String,
    #[serde(rename = "RunID", alias = "RunId", alias = "run_id", default)]
    run_id: String,
    #[serde(rename = "Changes", alias = "changes", default)]
    changes: Changes,
    #[serde(rename = "Tests", alias = "tests", default)]
    tests: TestReport,
    #[serde(rename = "ResultCode", alias = "result_code", default)]
    result_code: Option<String>,
}

impl RawWorkResult {
    fn into_result(self) -> Result<WorkResult> {
        let issue_ref = self.issue_ref.trim().to_string();
        let run_id = self.run_id.trim().to_string();
        if issue_ref.is_empty() {
            return Err(invalid!("work result is missing IssueRef"));
        }
        if run_id.is_empty() {
            return Err(invalid!("work result is missing RunID"));
        }
        Ok(WorkResult {
            issue_ref,
            run_id,
            changes: self.changes,
            tests: self.tests,
            result_code: ResultCode::parse_optional(self.result_code.as_deref().unwrap_or(""))?,
        })
    }
}

pub fn parse_json_result(contents: &str) -> Result<WorkResult> {
    let raw: RawWorkResult = serde_json::from_str(contents).context("decode work result json")?;
    raw.into_result()
}

/// Parse the legacy `Key: value` header block. Parsing stops at the first
/// blank line after a key has been seen.
///
/// ```text
/// IssueRef: local#3
/// RunID: 20261016-backend-2
/// Commit: git:abc123
/// Tests: go test ./... => pass
/// Evidence: ci log
/// ResultCode: none
/// ```
pub fn parse_text_result(contents: &str) -> Result<WorkResult> {
    let mut raw = RawWorkResult {
        issue_ref: String::new(),
        run_id: String::new(),
        changes: Changes::default(),
        tests: TestReport::default(),
        result_code: None,
    };
    let mut seen_key = false;
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if seen_key {
                break;
            }
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        seen_key = true;
        match key.trim() {
            "IssueRef" => raw.issue_ref = value,
            "RunID" | "RunId" => raw.run_id = value,
            "PR" => raw.changes.pr = value,
            "Commit" => raw.changes.commit = value,
            "Tests" => {
                let (command, result) = match value.split_once("=>") {
                    Some((command, result)) => (command.trim(), result.trim()),
                    None => ("", value.as_str()),
                };
                raw.tests.command = command.to_string();
                raw.tests.result = result.to_string();
            }
            "Evidence" => raw.tests.evidence = value,
            "ResultCode" => raw.result_code = Some(value),
            _ => {}
        }
    }
    raw.into_result()
}

/// Write the canonical JSON envelope.
pub fn write_work_result_json(path: &Path, result: &WorkResult) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(result)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Role;

    fn order() -> WorkOrder {
        WorkOrder {
            issue_ref: "local#3".to_string(),
            run_id: "20261016-backend-2".to_string(),
            role: Role::Backend,
            repo_dir: "/repo".to_string(),
        }
    }

    #[test]
    fn json_writer_and_loader_agree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pack = ContextPack::new(temp.path());
        let result = WorkResult {
            issue_ref: "local#3".to_string(),
            run_id: "20261016-backend-2".to_string(),
            changes: Changes {
                pr: String::new(),
                commit: "git:abc".to_string(),
            },
            tests: TestReport {
                command: "cargo test".to_string(),
                result: "fail".to_string(),
                evidence: "exit status 101".to_string(),
            },
            result_code: Some(ResultCode::TestFailed),
        };
        write_work_result_json(&pack.work_result_json(), &result).expect("write");
        let loaded = FileResultLoader.load(&pack, &order()).expect("load");
        assert_eq!(loaded.format, ResultFormat::Json);
        assert_eq!(loaded.result, result);
    }

    #[test]
    fn json_accepts_snake_case_legacy_shape() {
        let result = parse_json_result(
            r#"{"issue_ref":"local#3","run_id":"r1","changes":{"commit":"git:1"},
                "tests":{"result":"pass"},"result_code":"n/a"}"#,
        )
        .expect("parse");
        assert_eq!(result.run_id, "r1");
        assert_eq!(result.changes.commit, "git:1");
        assert_eq!(result.result_code, None);
    }

    #[test]
    fn json_missing_identity_is_an_error() {
        let err = parse_json_result(r#"{"IssueRef":"local#3"}"#).unwrap_err();
        assert!(err.to_string().contains("RunID"));
    }

    #[test]
    fn json_out_of_enum_code_is_rejected() {
        let err =
            parse_json_result(r#"{"IssueRef":"local#3","RunID":"r","ResultCode":"oops"}"#)
                .unwrap_err();
        assert!(crate::error::is_validation(&err));
    }

    #[test]
    fn text_format_parses_tests_line() {
        let result = parse_text_result(
            "IssueRef: local#3\nRunID: r2\nCommit: git:abc\nTests: go test ./... => pass\nEvidence: ok\nResultCode: none\n\nfree text\nIssueRef: local#9\n",
        )
        .expect("parse");
        assert_eq!(result.issue_ref, "local#3");
        assert_eq!(result.tests.command, "go test ./...");
        assert_eq!(result.tests.result, "pass");
        assert_eq!(result.tests.evidence, "ok");
        assert_eq!(result.result_code, None);
    }

    #[test]
    fn json_takes_precedence_over_text() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pack = ContextPack::new(temp.path());
        fs::write(pack.work_result_txt(), "IssueRef: local#3\nRunID: txt\n").expect("txt");
        fs::write(
            pack.work_result_json(),
            r#"{"IssueRef":"local#3","RunID":"json"}"#,
        )
        .expect("json");
        let loaded = FileResultLoader.load(&pack, &order()).expect("load");
        assert_eq!(loaded.result.run_id, "json");

        fs::remove_file(pack.work_result_json()).expect("rm");
        let loaded = FileResultLoader.load(&pack, &order()).expect("load");
        assert_eq!(loaded.format, ResultFormat::Text);
        assert_eq!(loaded.result.run_id, "txt");
    }

    #[test]
    fn logs_fallback_needs_stdout_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pack = ContextPack::new(temp.path());
        assert!(FileResultLoader.load(&pack, &order()).is_err());

        fs::write(pack.stdout_log(), "").expect("log");
        let loaded = FileResultLoader.load(&pack, &order()).expect("load");
        assert_eq!(loaded.format, ResultFormat::Logs);
        assert_eq!(loaded.result.issue_ref, "local#3");
        assert_eq!(loaded.result.run_id, "20261016-backend-2");
        assert_eq!(loaded.result.tests.evidence, "stdout.log");
    }
}
