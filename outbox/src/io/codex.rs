//! Codex runner used by the pipeline orchestrator.
//!
//! The [`CodexRunner`] trait decouples the pipeline loop from the agent
//! backend. [`CodexExecRunner`] spawns `codex exec`; tests script outcomes
//! without spawning anything.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{IssueRef, Role};
use crate::io::process::{CommandOutput, run_command_with_timeout};

const CODING_TEMPLATE: &str = include_str!("prompts/coding.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");
const TEST_TEMPLATE: &str = include_str!("prompts/test.md");
const STEP_OUTPUT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/step_output.schema.json"
));

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(1800);
const DEFAULT_OUTPUT_LIMIT: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Coding,
    Review,
    Test,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Coding => "coding",
            StepKind::Review => "review",
            StepKind::Test => "test",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pass,
    Fail,
}

/// One pipeline step to run.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub kind: StepKind,
    pub issue_ref: IssueRef,
    pub run_id: String,
    pub coding_role: Role,
    /// 1-based round of this step kind.
    pub round: u32,
    pub project_dir: PathBuf,
    /// Task prompt (file contents).
    pub task: String,
    /// Summary and evidence of the last failing review/test, fed to coding.
    pub feedback: Option<String>,
    /// Directory for the rendered prompt, output and log.
    pub artifacts_dir: PathBuf,
}

/// Validated step output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub summary: String,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.status == StepStatus::Pass
    }
}

pub trait CodexRunner {
    fn run_step(&self, request: &StepRequest) -> Result<StepResult>;
}

/// Runner that spawns `codex exec` with a JSON output schema.
#[derive(Debug, Clone)]
pub struct CodexExecRunner {
    pub program: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Default for CodexExecRunner {
    fn default() -> Self {
        Self {
            program: PathBuf::from("codex"),
            timeout: DEFAULT_STEP_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

impl CodexRunner for CodexExecRunner {
    #[instrument(skip_all, fields(kind = %request.kind, round = request.round, run_id = %request.run_id))]
    fn run_step(&self, request: &StepRequest) -> Result<StepResult> {
        let prompt = render_prompt(request)?;
        let dir = &request.artifacts_dir;
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let stem = format!("{}-{}", request.kind, request.round);
        let schema_path = dir.join("step_output.schema.json");
        let output_path = dir.join(format!("{stem}.output.json"));
        let log_path = dir.join(format!("{stem}.log"));
        fs::write(&schema_path, STEP_OUTPUT_SCHEMA)
            .with_context(|| format!("write {}", schema_path.display()))?;
        fs::write(dir.join(format!("{stem}.prompt.md")), &prompt)
            .with_context(|| format!("write prompt for {stem}"))?;
        if output_path.exists() {
            fs::remove_file(&output_path)
                .with_context(|| format!("remove stale {}", output_path.display()))?;
        }

        let mut cmd = Command::new(&self.program);
        cmd.arg("exec")
            .arg("--sandbox")
            .arg(match request.kind {
                StepKind::Review => "read-only",
                StepKind::Coding | StepKind::Test => "workspace-write",
            })
            .arg("--skip-git-repo-check")
            .arg("--output-schema")
            .arg(&schema_path)
            .arg("--output-last-message")
            .arg(&output_path)
            .arg("-")
            .current_dir(&request.project_dir);

        info!(project = %request.project_dir.display(), "starting codex exec");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run codex exec")?;
        write_log(&log_path, &output)?;

        if output.timed_out {
            warn!("codex exec timed out");
            bail!("codex exec timed out after {}s", self.timeout.as_secs());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "codex exec failed");
            bail!(
                "codex exec failed with status {:?} (see {})",
                output.status.code(),
                log_path.display()
            );
        }
        if !output_path.exists() {
            bail!("missing codex output {}", output_path.display());
        }
        let contents = fs::read_to_string(&output_path)
            .with_context(|| format!("read {}", output_path.display()))?;
        let result = parse_step_output(&contents)
            .with_context(|| format!("validate {}", output_path.display()))?;
        debug!(status = ?result.status, "step output parsed");
        Ok(result)
    }
}

/// Render the prompt template for a step.
pub fn render_prompt(request: &StepRequest) -> Result<String> {
    let mut env = Environment::new();
    let (name, source) = match request.kind {
        StepKind::Coding => ("coding", CODING_TEMPLATE),
        StepKind::Review => ("review", REVIEW_TEMPLATE),
        StepKind::Test => ("test", TEST_TEMPLATE),
    };
    env.add_template(name, source)
        .with_context(|| format!("load {name} template"))?;
    let rendered = env.get_template(name)?.render(context! {
        role => request.coding_role.as_str(),
        issue_ref => request.issue_ref.to_string(),
        run_id => request.run_id.as_str(),
        round => request.round,
        task => request.task.trim(),
        feedback => request.feedback.as_deref().map(str::trim).filter(|s| !s.is_empty()),
    })?;
    Ok(rendered)
}

/// Schema-check and decode a step output document.
pub fn parse_step_output(contents: &str) -> Result<StepResult> {
    let value: Value = serde_json::from_str(contents).context("parse step output json")?;
    let schema: Value =
        serde_json::from_str(STEP_OUTPUT_SCHEMA).context("parse step output schema")?;
    let validator =
        jsonschema::validator_for(&schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("step output schema validation failed: {}", messages.join("; "));
    }
    serde_json::from_value(value).context("decode step output")
}

fn write_log(path: &Path, output: &CommandOutput) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice("codex"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice("codex"));
    if output.timed_out {
        buf.push_str("\n[codex timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write codex log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: StepKind) -> StepRequest {
        StepRequest {
            kind,
            issue_ref: IssueRef(8),
            run_id: "20261016-backend-1".to_string(),
            coding_role: Role::Backend,
            round: 2,
            project_dir: PathBuf::from("/project"),
            task: "Add retries to the uploader.\n".to_string(),
            feedback: Some("missing test for backoff".to_string()),
            artifacts_dir: PathBuf::from("/tmp/artifacts"),
        }
    }

    #[test]
    fn coding_prompt_includes_task_and_feedback() {
        let prompt = render_prompt(&request(StepKind::Coding)).expect("render");
        assert!(prompt.contains("issue local#8"));
        assert!(prompt.contains("round 2"));
        assert!(prompt.contains("Add retries to the uploader."));
        assert!(prompt.contains("missing test for backoff"));
    }

    #[test]
    fn coding_prompt_omits_empty_feedback() {
        let mut req = request(StepKind::Coding);
        req.feedback = Some("   ".to_string());
        let prompt = render_prompt(&req).expect("render");
        assert!(!prompt.contains("Feedback from the previous round"));
    }

    #[test]
    fn review_prompt_forbids_edits() {
        let prompt = render_prompt(&request(StepKind::Review)).expect("render");
        assert!(prompt.contains("Do not modify files."));
    }

    #[test]
    fn step_output_is_schema_checked() {
        let ok = parse_step_output(r#"{"status":"fail","summary":"nope","evidence":["a.rs:3"]}"#)
            .expect("parse");
        assert!(!ok.passed());
        assert_eq!(ok.evidence, vec!["a.rs:3".to_string()]);

        let err = parse_step_output(r#"{"status":"maybe","summary":"x","evidence":[]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
        assert!(parse_step_output(r#"{"status":"pass","evidence":[]}"#).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn exec_runner_reads_validated_output() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let program = temp.path().join("fake-codex.sh");
        // Writes a passing result to the path following --output-last-message.
        fs::write(
            &program,
            "#!/bin/sh\ncat >/dev/null\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = --output-last-message ]; then out=\"$2\"; fi\n  shift\ndone\nprintf '{\"status\":\"pass\",\"summary\":\"done\",\"evidence\":[\"ok\"]}' > \"$out\"\n",
        )
        .expect("write");
        let mut perms = fs::metadata(&program).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&program, perms).expect("chmod");

        let runner = CodexExecRunner {
            program,
            ..CodexExecRunner::default()
        };
        let mut req = request(StepKind::Test);
        req.project_dir = temp.path().to_path_buf();
        req.artifacts_dir = temp.path().join("artifacts");
        let result = runner.run_step(&req).expect("run");
        assert!(result.passed());
        assert!(req.artifacts_dir.join("test-2.prompt.md").exists());
        assert!(req.artifacts_dir.join("test-2.log").exists());
    }
}
