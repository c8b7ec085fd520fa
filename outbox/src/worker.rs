//! `outbox worker run`: the worker side of the invocation protocol.
//!
//! Reads the work order from a context pack, runs the role's executor in the
//! order's RepoDir and writes `work_result.json` echoing IssueRef and RunID.

use std::io::Write;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Changes, ResultCode, TestReport, WorkResult};
use crate::error::invalid;
use crate::io::config::WorkflowProfile;
use crate::io::context_pack::ContextPack;
use crate::io::git::Git;
use crate::io::process::run_command_with_timeout;
use crate::io::work_result::write_work_result_json;

const OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;
const COMMIT_SHA_LEN: usize = 12;

/// Execute the work order in `pack_dir` and write its result file.
#[instrument(skip_all, fields(pack = %pack_dir.display()))]
pub fn run_worker(pack_dir: &Path, profile: &WorkflowProfile) -> Result<WorkResult> {
    let pack = ContextPack::new(pack_dir);
    let order = pack.read_work_order()?;
    profile.ensure_enabled(order.role)?;
    let repo_dir = Path::new(&order.repo_dir);
    if !repo_dir.is_dir() {
        return Err(invalid!("RepoDir {} is not a directory", repo_dir.display()));
    }
    let executor = profile.executor_for(order.role);

    let mut cmd = Command::new(&executor.program);
    cmd.args(&executor.args).current_dir(repo_dir);
    info!(
        role = %order.role,
        run_id = %order.run_id,
        command = %executor.display_command(),
        "running executor"
    );
    let output = run_command_with_timeout(cmd, None, executor.timeout(), OUTPUT_LIMIT_BYTES)
        .with_context(|| format!("run executor `{}`", executor.display_command()))?;

    // Our own stdout/stderr are the pack's log files.
    std::io::stdout()
        .write_all(&output.stdout)
        .context("forward executor stdout")?;
    std::io::stderr()
        .write_all(&output.stderr)
        .context("forward executor stderr")?;

    let (result, evidence, result_code) = if output.timed_out {
        warn!(timeout_secs = executor.timeout_seconds, "executor timed out");
        (
            "fail",
            format!("timed out after {}s", executor.timeout_seconds),
            Some(ResultCode::EnvUnavailable),
        )
    } else if output.status.success() {
        ("pass", exit_evidence(output.status.code()), None)
    } else {
        (
            "fail",
            exit_evidence(output.status.code()),
            Some(ResultCode::TestFailed),
        )
    };

    let work_result = WorkResult {
        issue_ref: order.issue_ref.clone(),
        run_id: order.run_id.clone(),
        changes: Changes {
            pr: String::new(),
            commit: head_commit(repo_dir).unwrap_or_default(),
        },
        tests: TestReport {
            command: executor.display_command(),
            result: result.to_string(),
            evidence,
        },
        result_code,
    };
    write_work_result_json(&pack.work_result_json(), &work_result)?;
    info!(result, "work result written");
    Ok(work_result)
}

fn exit_evidence(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// `git:<short sha>` when `repo_dir` is a git checkout.
fn head_commit(repo_dir: &Path) -> Option<String> {
    match Git::new(repo_dir).head_short_sha(COMMIT_SHA_LEN) {
        Ok(sha) if !sha.is_empty() => Some(format!("git:{sha}")),
        Ok(_) => None,
        Err(err) => {
            debug!(err = %err, "no commit evidence");
            None
        }
    }
}
