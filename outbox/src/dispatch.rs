//! Per-issue driver: skip rules, blocking checks, spawn, result validation and
//! write-back.
//!
//! Execution problems (worker failure, unusable result, identity mismatch)
//! become blocked comments with `needs-human`; they never abort the tick.
//! Store and cache failures do.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::comment::StructuredComment;
use crate::core::labels::{AUTOFLOW_OFF, NEEDS_HUMAN};
use crate::core::outcome::{Classification, classify};
use crate::core::path::sanitize_component;
use crate::core::precondition::unresolved_dependencies;
use crate::core::types::{Issue, IssueRef, ResultCode, Role, WorkOrder, WorkResult, WorkState, format_run_id};
use crate::io::cache::{get_i64, keys};
use crate::io::config::Writeback;
use crate::io::context_pack::{ContextPack, format_read_cursor, write_context_pack};
use crate::io::invoker::Invocation;
use crate::io::store::IssueStore;
use crate::issues::dependency_status;
use crate::sync::{Admission, SyncEngine, TickContext};

pub const BLOCKER_WORKER_EXECUTION: &str = "worker-execution";
pub const BLOCKER_WORKER_RESULT: &str = "worker-result";
pub const BLOCKER_RESULT_ECHO: &str = "work-result-echo";
pub const BLOCKER_WORKDIR_PREPARE: &str = "workdir-prepare";
pub const BLOCKER_WORKDIR_CLEANUP: &str = "workdir-cleanup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    Closed,
    NotAssigned,
    AutoflowOff,
    State(WorkState),
}

/// What the driver did with one issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    Skipped(SkipReason),
    /// Eligible, but the spawn cap for this tick was already used.
    Deferred,
    /// Blocked before any worker started.
    Blocked { blocked_by: Vec<String> },
    /// A worker ran but its outcome could not be used.
    Failed { run_id: String, blocked_by: Vec<String> },
    /// Superseded by a newer run; discarded without a comment.
    Stale { run_id: String },
    Completed {
        run_id: String,
        classification: Classification,
        cleanup_failed: bool,
    },
}

impl IssueOutcome {
    pub fn is_skip(&self) -> bool {
        matches!(self, IssueOutcome::Skipped(_) | IssueOutcome::Deferred)
    }

    pub fn spawned(&self) -> bool {
        matches!(
            self,
            IssueOutcome::Failed { .. } | IssueOutcome::Stale { .. } | IssueOutcome::Completed { .. }
        )
    }

    pub fn blocked(&self) -> bool {
        match self {
            IssueOutcome::Blocked { .. } | IssueOutcome::Failed { .. } => true,
            IssueOutcome::Completed {
                classification,
                cleanup_failed,
                ..
            } => !classification.is_success() || *cleanup_failed,
            _ => false,
        }
    }
}

/// Write-back requested by one outcome.
struct WriteBack<'c> {
    comment: &'c StructuredComment,
    state: WorkState,
    needs_human: bool,
}

impl<S: IssueStore> SyncEngine<'_, S> {
    #[instrument(skip_all, fields(role = %ctx.role, %issue))]
    pub(crate) fn drive_issue(
        &self,
        ctx: &TickContext,
        issue: IssueRef,
        admission: &mut Admission,
    ) -> Result<IssueOutcome> {
        let Some(current) = self.store.read(|tx| tx.find_issue(issue))? else {
            return Ok(IssueOutcome::Skipped(SkipReason::NotFound));
        };
        if let Some(reason) = skip_reason(ctx, &current) {
            return Ok(IssueOutcome::Skipped(reason));
        }

        if current.has_label(NEEDS_HUMAN) {
            let blocked_by = vec![NEEDS_HUMAN.to_string()];
            let comment = StructuredComment {
                action: "block".to_string(),
                status: WorkState::Blocked.to_string(),
                result_code: Some(ResultCode::ManualIntervention),
                summary: "needs-human is set; automation paused".to_string(),
                blocked_by: blocked_by.clone(),
                next: "human".to_string(),
                ..self.base_comment(ctx, issue, "")
            };
            self.write_back(ctx, issue, WriteBack {
                comment: &comment,
                state: WorkState::Blocked,
                needs_human: false,
            })?;
            return Ok(IssueOutcome::Blocked { blocked_by });
        }

        let deps = self.store.read(|tx| dependency_status(tx, &current.body))?;
        let unresolved = unresolved_dependencies(&current.body, &deps);
        if !unresolved.is_empty() {
            let comment = StructuredComment {
                action: "block".to_string(),
                status: WorkState::Blocked.to_string(),
                result_code: Some(ResultCode::DepUnresolved),
                summary: format!("waiting on {}", unresolved.join(", ")),
                blocked_by: unresolved.clone(),
                next: "wait for dependencies".to_string(),
                ..self.base_comment(ctx, issue, "")
            };
            self.write_back(ctx, issue, WriteBack {
                comment: &comment,
                state: WorkState::Blocked,
                needs_human: false,
            })?;
            return Ok(IssueOutcome::Blocked {
                blocked_by: unresolved,
            });
        }

        if !admission.try_acquire() {
            return Ok(IssueOutcome::Deferred);
        }
        self.spawn(ctx, &current, admission)
    }

    fn spawn(
        &self,
        ctx: &TickContext,
        issue: &Issue,
        admission: &mut Admission,
    ) -> Result<IssueOutcome> {
        let role = ctx.role;
        let issue_ref = issue.issue_ref;
        let run_id = self.allocate_run(role, issue_ref)?;
        if ctx.writeback == Writeback::Full {
            self.store
                .transaction(|tx| tx.set_state(issue_ref, WorkState::Doing))?;
        }

        let workdir = if self.workdirs.enabled_for(role) {
            match self.workdirs.prepare(role, issue_ref, &run_id) {
                Ok(path) => Some(path),
                Err(err) => {
                    admission.release();
                    return self.block_prepare(ctx, issue_ref, &run_id, err);
                }
            }
        } else {
            None
        };
        let repo_dir = workdir
            .clone()
            .unwrap_or_else(|| self.profile.repo_dir(role));
        let order = WorkOrder {
            issue_ref: issue_ref.to_string(),
            run_id: run_id.clone(),
            role,
            repo_dir: repo_dir.display().to_string(),
        };
        let exec = Execution {
            ctx,
            issue: issue_ref,
            run_id: &run_id,
            workdir: workdir.as_deref(),
        };

        let dir = pack_dir(&self.pack_root, role, issue_ref, &run_id);
        let pack = match write_context_pack(&dir, &order, &issue.body, ctx.cursor) {
            Ok(pack) => pack,
            Err(err) => {
                return self.block_execution(
                    &exec,
                    BLOCKER_WORKER_EXECUTION,
                    ResultCode::ManualIntervention,
                    err.context("write context pack"),
                    None,
                );
            }
        };

        info!(run_id = %run_id, repo_dir = %order.repo_dir, "spawning worker");
        let invocation = Invocation {
            pack: &pack,
            order: &order,
            workflow: &self.workflow_path,
            timeout: self.profile.executor_for(role).timeout(),
        };
        if let Err(err) = self.invoker.invoke(&invocation) {
            return self.block_execution(
                &exec,
                BLOCKER_WORKER_EXECUTION,
                ResultCode::ManualIntervention,
                err,
                None,
            );
        }

        let loaded = match self.loader.load(&pack, &order) {
            Ok(loaded) => loaded,
            Err(err) => {
                return self.block_execution(
                    &exec,
                    BLOCKER_WORKER_RESULT,
                    ResultCode::OutputUnparseable,
                    err,
                    None,
                );
            }
        };
        let result = loaded.result;

        let active = match self.cache.get(&keys::active_run(role, issue_ref)) {
            Ok(active) => active,
            Err(err) => {
                self.cleanup_quietly(&exec);
                return Err(err.context("read active run token"));
            }
        };
        let active = active.unwrap_or_default();
        if active != run_id || result.run_id != active {
            warn!(
                run_id = %run_id,
                active = %active,
                reported = %result.run_id,
                "stale run, discarding result"
            );
            self.cleanup_quietly(&exec);
            return Ok(IssueOutcome::Stale { run_id });
        }

        if result.issue_ref != order.issue_ref || result.run_id != order.run_id {
            let err = anyhow!(
                "result echoes {} / {}, expected {} / {}",
                result.issue_ref,
                result.run_id,
                order.issue_ref,
                order.run_id
            );
            return self.block_execution(
                &exec,
                BLOCKER_RESULT_ECHO,
                ResultCode::OutputUnparseable,
                err,
                Some(&result),
            );
        }

        let classification = classify(role, &result, &issue.labels);
        let comment = self.outcome_comment(&exec, &pack, &result, classification);
        let state = if classification.is_success() {
            WorkState::Review
        } else {
            WorkState::Blocked
        };
        self.write_back(ctx, issue_ref, WriteBack {
            comment: &comment,
            state,
            needs_human: false,
        })?;
        info!(run_id = %run_id, ?classification, "run written back");

        let cleanup_failed = match self.cleanup(&exec) {
            Ok(()) => false,
            Err(err) => {
                warn!(err = %err, "workdir cleanup failed after run");
                let mut followup = StructuredComment {
                    action: "block".to_string(),
                    status: WorkState::Blocked.to_string(),
                    result_code: Some(ResultCode::ManualIntervention),
                    summary: format!("workdir cleanup failed: {err:#}"),
                    blocked_by: vec![BLOCKER_WORKDIR_CLEANUP.to_string(), NEEDS_HUMAN.to_string()],
                    next: "human".to_string(),
                    ..self.base_comment(ctx, issue_ref, &run_id)
                };
                followup.changes = result.changes.clone();
                followup.tests = result.tests.clone();
                self.write_back(ctx, issue_ref, WriteBack {
                    comment: &followup,
                    state: WorkState::Blocked,
                    needs_human: true,
                })?;
                true
            }
        };
        Ok(IssueOutcome::Completed {
            run_id,
            classification,
            cleanup_failed,
        })
    }

    /// Bump the per-issue sequence and record the new run as active.
    fn allocate_run(&self, role: Role, issue: IssueRef) -> Result<String> {
        let seq_key = keys::run_seq(role, issue);
        let seq = u64::try_from(get_i64(self.cache, &seq_key)?).unwrap_or(0) + 1;
        self.cache
            .set(&seq_key, &seq.to_string())
            .context("persist run sequence")?;
        let date = Utc::now().format("%Y%m%d").to_string();
        let run_id = format_run_id(&date, role, seq);
        self.cache
            .set(&keys::active_run(role, issue), &run_id)
            .context("record active run token")?;
        Ok(run_id)
    }

    fn base_comment(&self, ctx: &TickContext, issue: IssueRef, run_id: &str) -> StructuredComment {
        StructuredComment {
            role: ctx.role.to_string(),
            repo: self.profile.repo_key(ctx.role).to_string(),
            issue_ref: issue.to_string(),
            run_id: run_id.to_string(),
            read_up_to: format_read_cursor(ctx.cursor),
            trigger: ctx.trigger.to_string(),
            ..StructuredComment::default()
        }
    }

    fn outcome_comment(
        &self,
        exec: &Execution<'_>,
        pack: &ContextPack,
        result: &WorkResult,
        classification: Classification,
    ) -> StructuredComment {
        let role = exec.ctx.role;
        let (action, status, summary, blocked_by, next) = match classification {
            Classification::Success => (
                "complete",
                WorkState::Review,
                "ready for review/merge".to_string(),
                Vec::new(),
                if role == Role::Reviewer {
                    Role::Integrator.to_string()
                } else {
                    Role::Reviewer.to_string()
                },
            ),
            Classification::MissingEvidence => (
                "block",
                WorkState::Blocked,
                "worker reported no Changes and no Tests result".to_string(),
                vec!["missing-evidence".to_string()],
                "human".to_string(),
            ),
            Classification::ChangesRequested { next } => (
                "block",
                WorkState::Blocked,
                "review requested changes".to_string(),
                Vec::new(),
                next.to_string(),
            ),
            Classification::Failed(code) => (
                "block",
                WorkState::Blocked,
                format!("{code}: investigate and rerun (logs in {})", pack.dir().display()),
                vec![code.to_string()],
                role.to_string(),
            ),
        };
        StructuredComment {
            action: action.to_string(),
            status: status.to_string(),
            result_code: classification.result_code(),
            summary,
            changes: result.changes.clone(),
            tests: result.tests.clone(),
            blocked_by,
            next,
            ..self.base_comment(exec.ctx, exec.issue, exec.run_id)
        }
    }

    fn write_back(&self, ctx: &TickContext, issue: IssueRef, wb: WriteBack<'_>) -> Result<()> {
        self.store.transaction(|tx| {
            if ctx.writeback == Writeback::Full {
                tx.set_state(issue, wb.state)?;
                if wb.needs_human {
                    tx.add_label(issue, NEEDS_HUMAN)?;
                }
            }
            tx.append_event(issue, &ctx.lead, &wb.comment.render())?;
            Ok(())
        })
    }

    fn block_prepare(
        &self,
        ctx: &TickContext,
        issue: IssueRef,
        run_id: &str,
        err: anyhow::Error,
    ) -> Result<IssueOutcome> {
        warn!(err = %err, "workdir prepare failed");
        let blocked_by = vec![BLOCKER_WORKDIR_PREPARE.to_string()];
        let comment = StructuredComment {
            action: "block".to_string(),
            status: WorkState::Blocked.to_string(),
            result_code: Some(ResultCode::EnvUnavailable),
            summary: format!("workdir prepare failed: {err:#}"),
            blocked_by: blocked_by.clone(),
            next: ctx.role.to_string(),
            ..self.base_comment(ctx, issue, run_id)
        };
        self.write_back(ctx, issue, WriteBack {
            comment: &comment,
            state: WorkState::Blocked,
            needs_human: false,
        })?;
        Ok(IssueOutcome::Blocked { blocked_by })
    }

    /// Blocked + needs-human for an execution error. Cleanup runs first and
    /// its failure is appended to the same comment.
    fn block_execution(
        &self,
        exec: &Execution<'_>,
        blocker: &str,
        code: ResultCode,
        err: anyhow::Error,
        evidence: Option<&WorkResult>,
    ) -> Result<IssueOutcome> {
        warn!(blocker, err = %err, "worker execution blocked");
        let mut blocked_by = vec![blocker.to_string(), NEEDS_HUMAN.to_string()];
        let mut summary = format!("{blocker}: {err:#}");
        if let Err(cleanup_err) = self.cleanup(exec) {
            warn!(err = %cleanup_err, "workdir cleanup failed");
            blocked_by.push(BLOCKER_WORKDIR_CLEANUP.to_string());
            summary.push_str(&format!("\nworkdir cleanup failed: {cleanup_err:#}"));
        }
        let mut comment = StructuredComment {
            action: "block".to_string(),
            status: WorkState::Blocked.to_string(),
            result_code: Some(code),
            summary,
            blocked_by: blocked_by.clone(),
            next: "human".to_string(),
            ..self.base_comment(exec.ctx, exec.issue, exec.run_id)
        };
        if let Some(result) = evidence {
            comment.changes = result.changes.clone();
            comment.tests = result.tests.clone();
        }
        self.write_back(exec.ctx, exec.issue, WriteBack {
            comment: &comment,
            state: WorkState::Blocked,
            needs_human: true,
        })?;
        Ok(IssueOutcome::Failed {
            run_id: exec.run_id.to_string(),
            blocked_by,
        })
    }

    fn cleanup(&self, exec: &Execution<'_>) -> Result<()> {
        let Some(path) = exec.workdir else {
            return Ok(());
        };
        self.workdirs
            .cleanup(exec.ctx.role, exec.issue, exec.run_id, path)
    }

    fn cleanup_quietly(&self, exec: &Execution<'_>) {
        if let Err(err) = self.cleanup(exec) {
            warn!(err = %err, "workdir cleanup failed");
        }
    }
}

/// One in-flight run.
struct Execution<'e> {
    ctx: &'e TickContext,
    issue: IssueRef,
    run_id: &'e str,
    workdir: Option<&'e Path>,
}

fn skip_reason(ctx: &TickContext, issue: &Issue) -> Option<SkipReason> {
    if issue.closed {
        return Some(SkipReason::Closed);
    }
    if issue.assignee.as_deref().map(str::trim) != Some(ctx.lead.as_str()) {
        return Some(SkipReason::NotAssigned);
    }
    if issue.has_label(AUTOFLOW_OFF) {
        return Some(SkipReason::AutoflowOff);
    }
    if ctx.force {
        return None;
    }
    match issue.state() {
        Some(state @ (WorkState::Blocked | WorkState::Done)) => Some(SkipReason::State(state)),
        Some(WorkState::Review) if ctx.role != Role::Reviewer => {
            Some(SkipReason::State(WorkState::Review))
        }
        _ => None,
    }
}

/// Context pack location for a run, relative to the pack root.
pub fn pack_dir(pack_root: &Path, role: Role, issue: IssueRef, run_id: &str) -> PathBuf {
    pack_root
        .join(sanitize_component(role.as_str()))
        .join(sanitize_component(&issue.to_string()))
        .join(sanitize_component(run_id))
}
