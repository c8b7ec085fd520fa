//! Coding → review → test pipeline driven directly through a [`CodexRunner`].
//!
//! Review and test outcomes are funneled through quality ingestion, so the
//! labels the merge gate reads are the same ones webhooks would set. Every
//! non-recoverable exit is a manual intervention: `needs-human`,
//! `state:blocked` and an audit comment.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::comment::StructuredComment;
use crate::core::labels::NEEDS_HUMAN;
use crate::core::types::{IssueRef, ResultCode, Role, WorkState};
use crate::error::invalid;
use crate::io::codex::{CodexRunner, StepKind, StepRequest, StepResult};
use crate::io::store::IssueStore;
use crate::issues;
use crate::quality::{self, IngestRequest};

pub const DEFAULT_MAX_REVIEW_ROUND: u32 = 3;
pub const DEFAULT_MAX_TEST_ROUND: u32 = 3;

const QUALITY_SOURCE: &str = "codex";

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub issue_ref: IssueRef,
    pub project_dir: PathBuf,
    pub prompt_file: PathBuf,
    pub coding_role: Role,
    /// Review failures tolerated before giving up.
    pub max_review_round: u32,
    /// Test failures tolerated before giving up.
    pub max_test_round: u32,
    pub run_id: String,
    /// Prompts, step outputs and logs land here.
    pub artifacts_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineOutcome {
    pub issue_ref: String,
    pub run_id: String,
    pub ready_to_merge: bool,
    pub coding_rounds: u32,
    pub review_failures: u32,
    pub test_failures: u32,
    /// `ready`, or why the pipeline stopped for a human.
    pub reason: String,
}

struct Pipeline<'a, S> {
    store: &'a S,
    runner: &'a dyn CodexRunner,
    request: &'a PipelineRequest,
    task: String,
    outcome: PipelineOutcome,
}

/// Run the pipeline to completion or manual intervention.
#[instrument(skip_all, fields(issue = %request.issue_ref, run_id = %request.run_id))]
pub fn run_pipeline<S: IssueStore>(
    store: &S,
    runner: &dyn CodexRunner,
    request: &PipelineRequest,
) -> Result<PipelineOutcome> {
    if request.run_id.trim().is_empty() {
        return Err(invalid!("run id is required"));
    }
    let task = fs::read_to_string(&request.prompt_file)
        .with_context(|| format!("read prompt file {}", request.prompt_file.display()))?;
    if task.trim().is_empty() {
        return Err(invalid!(
            "prompt file {} is empty",
            request.prompt_file.display()
        ));
    }
    let issue = store.read(|tx| tx.issue(request.issue_ref))?;
    if issue.closed {
        return Err(invalid!("{} is closed", request.issue_ref));
    }

    let pipeline = Pipeline {
        store,
        runner,
        request,
        task,
        outcome: PipelineOutcome {
            issue_ref: request.issue_ref.to_string(),
            run_id: request.run_id.clone(),
            ready_to_merge: false,
            coding_rounds: 0,
            review_failures: 0,
            test_failures: 0,
            reason: String::new(),
        },
    };
    pipeline.run()
}

impl<S: IssueStore> Pipeline<'_, S> {
    fn run(mut self) -> Result<PipelineOutcome> {
        let mut feedback: Option<String> = None;
        let mut review_round = 0;
        let mut test_round = 0;
        loop {
            self.outcome.coding_rounds += 1;
            // A failed review or test left the issue blocked; coding resumes it.
            self.set_state(WorkState::Doing)?;
            let coding = self.step(StepKind::Coding, self.outcome.coding_rounds, feedback.take());
            match coding {
                Ok(result) if result.passed() => self.set_state(WorkState::Review)?,
                Ok(result) => return self.manual(format!("coding step failed: {}", result.summary)),
                Err(err) => return self.manual(format!("coding step error: {err:#}")),
            }

            review_round += 1;
            let review = match self.step(StepKind::Review, review_round, None) {
                Ok(result) => result,
                Err(err) => return self.manual(format!("review step error: {err:#}")),
            };
            self.record(StepKind::Review, review_round, &review)?;
            if !review.passed() {
                self.outcome.review_failures += 1;
                if self.outcome.review_failures > self.request.max_review_round {
                    let reason = format!(
                        "review failed {} times (limit {})",
                        self.outcome.review_failures, self.request.max_review_round
                    );
                    return self.manual(reason);
                }
                feedback = Some(render_feedback(StepKind::Review, &review));
                continue;
            }

            test_round += 1;
            let test = match self.step(StepKind::Test, test_round, None) {
                Ok(result) => result,
                Err(err) => return self.manual(format!("test step error: {err:#}")),
            };
            self.record(StepKind::Test, test_round, &test)?;
            if !test.passed() {
                self.outcome.test_failures += 1;
                if self.outcome.test_failures > self.request.max_test_round {
                    let reason = format!(
                        "tests failed {} times (limit {})",
                        self.outcome.test_failures, self.request.max_test_round
                    );
                    return self.manual(reason);
                }
                feedback = Some(render_feedback(StepKind::Test, &test));
                continue;
            }

            let readiness = issues::merge_check(self.store, self.request.issue_ref)?;
            if !readiness.ready {
                return self.manual(format!("merge gate refused: {}", readiness.reason));
            }
            info!(coding_rounds = self.outcome.coding_rounds, "pipeline ready to merge");
            self.outcome.ready_to_merge = true;
            self.outcome.reason = readiness.reason.to_string();
            return Ok(self.outcome);
        }
    }

    fn step(&self, kind: StepKind, round: u32, feedback: Option<String>) -> Result<StepResult> {
        let request = StepRequest {
            kind,
            issue_ref: self.request.issue_ref,
            run_id: self.request.run_id.clone(),
            coding_role: self.request.coding_role,
            round,
            project_dir: self.request.project_dir.clone(),
            task: self.task.clone(),
            feedback,
            artifacts_dir: self.request.artifacts_dir.clone(),
        };
        let result = self.runner.run_step(&request)?;
        info!(%kind, round, passed = result.passed(), "pipeline step finished");
        Ok(result)
    }

    /// Ingest a review or test outcome as a quality event.
    fn record(&self, kind: StepKind, round: u32, result: &StepResult) -> Result<()> {
        let (category, verdict) = match (kind, result.passed()) {
            (StepKind::Review, true) => ("review", "approved"),
            (StepKind::Review, false) => ("review", "changes_requested"),
            (_, true) => ("ci", "pass"),
            (_, false) => ("ci", "fail"),
        };
        let mut evidence = result.evidence.clone();
        if evidence.is_empty() && !result.passed() {
            evidence.push(format!("codex://{kind}/{}", self.request.run_id));
        }
        let outcome = quality::ingest(
            self.store,
            &IngestRequest {
                issue_ref: self.request.issue_ref,
                source: QUALITY_SOURCE.to_string(),
                category: Some(category.to_string()),
                result: Some(verdict.to_string()),
                actor: Some(format!("codex-{kind}")),
                summary: Some(result.summary.clone()),
                evidence,
                external_event_id: Some(format!("{}/{kind}-{round}", self.request.run_id)),
                ..IngestRequest::default()
            },
        )?;
        if outcome.duplicate {
            warn!(%kind, round, "pipeline quality event was already recorded");
        }
        Ok(())
    }

    fn set_state(&self, state: WorkState) -> Result<()> {
        let issue = self.request.issue_ref;
        self.store.transaction(|tx| tx.set_state(issue, state))
    }

    fn manual(mut self, reason: String) -> Result<PipelineOutcome> {
        warn!(%reason, "pipeline needs manual intervention");
        let issue = self.request.issue_ref;
        let comment = StructuredComment {
            role: self.request.coding_role.to_string(),
            issue_ref: issue.to_string(),
            run_id: self.request.run_id.clone(),
            action: "block".to_string(),
            status: WorkState::Blocked.to_string(),
            result_code: Some(ResultCode::ManualIntervention),
            trigger: "pipeline".to_string(),
            summary: reason.clone(),
            next: "human".to_string(),
            ..StructuredComment::default()
        };
        let actor = self.request.coding_role.lead_actor();
        self.store.transaction(|tx| {
            tx.add_label(issue, NEEDS_HUMAN)?;
            issues::block_with_comment(tx, issue, &actor, &comment)?;
            Ok(())
        })?;
        self.outcome.reason = reason;
        Ok(self.outcome)
    }
}

fn render_feedback(kind: StepKind, result: &StepResult) -> String {
    let mut text = format!("{kind} failed: {}", result.summary.trim());
    for item in &result.evidence {
        text.push_str("\n- ");
        text.push_str(item);
    }
    text
}
