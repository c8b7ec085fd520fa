//! Sync engine: one polling tick for one role.
//!
//! A tick reads the role's event cursor, collects candidate issues (touched by
//! new events, matching a listen label, or assigned to the role's lead actor),
//! drives each one through [`crate::dispatch`] in ascending id order and
//! finally persists the advanced cursor.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::core::types::{IssueRef, Role};
use crate::dispatch::IssueOutcome;
use crate::error::invalid;
use crate::io::cache::{KvCache, get_i64, keys};
use crate::io::config::{SUPPORTED_BACKEND, WorkflowProfile, Writeback};
use crate::io::invoker::{SelfExecInvoker, WorkerInvoker};
use crate::io::store::IssueStore;
use crate::io::work_result::{FileResultLoader, ResultLoader};
use crate::io::workdir::{WorkdirProvider, WorktreeManager};

pub const DEFAULT_EVENT_BATCH: usize = 200;

/// Parameters of one tick.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub role: Role,
    /// Actor the role drives issues for; `lead-<role>` when empty.
    pub assignee: Option<String>,
    /// Maximum events read past the cursor in this tick.
    pub event_batch: usize,
}

impl SyncRequest {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            assignee: None,
            event_batch: DEFAULT_EVENT_BATCH,
        }
    }

    pub fn lead_actor(&self) -> String {
        match self.assignee.as_deref().map(str::trim) {
            Some(actor) if !actor.is_empty() => actor.to_string(),
            _ => self.role.lead_actor(),
        }
    }
}

/// Tick counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub cursor_before: i64,
    pub cursor_after: i64,
    pub candidates: usize,
    pub processed: usize,
    pub blocked: usize,
    pub spawned: usize,
    pub skipped: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: &IssueOutcome) {
        if outcome.is_skip() {
            self.skipped += 1;
            return;
        }
        self.processed += 1;
        if outcome.spawned() {
            self.spawned += 1;
        }
        if outcome.blocked() {
            self.blocked += 1;
        }
    }
}

/// Per-tick spawn admission. This is a cap on spawns, not a worker pool:
/// workers still run one after another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    cap: usize,
    used: usize,
}

impl Admission {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            used: 0,
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        if self.used >= self.cap {
            return false;
        }
        self.used += 1;
        true
    }

    /// Give back a slot that never produced a spawn.
    pub fn release(&mut self) {
        self.used = self.used.saturating_sub(1);
    }
}

/// What drives the per-issue driver in this tick.
#[derive(Debug, Clone)]
pub(crate) struct TickContext {
    pub role: Role,
    pub lead: String,
    /// Read cursor recorded on comments and in the context pack.
    pub cursor: i64,
    pub trigger: &'static str,
    /// Bypass the state-based skip (interactive "switch worker").
    pub force: bool,
    pub writeback: Writeback,
}

/// Sync engine with its collaborators chosen once at build time.
pub struct SyncEngine<'a, S> {
    pub(crate) store: &'a S,
    pub(crate) cache: &'a dyn KvCache,
    pub(crate) profile: &'a WorkflowProfile,
    /// Profile path handed to worker subprocesses.
    pub(crate) workflow_path: PathBuf,
    /// Root for context packs: `<pack_root>/<role>/<issue>/<run>`.
    pub(crate) pack_root: PathBuf,
    pub(crate) invoker: Box<dyn WorkerInvoker + 'a>,
    pub(crate) loader: Box<dyn ResultLoader + 'a>,
    pub(crate) workdirs: Box<dyn WorkdirProvider + 'a>,
}

impl<'a, S: IssueStore> SyncEngine<'a, S> {
    /// Engine with the production collaborators: self-exec worker, file
    /// result loader, git-worktree sandboxes.
    pub fn new(
        store: &'a S,
        cache: &'a dyn KvCache,
        profile: &'a WorkflowProfile,
        workflow_path: impl Into<PathBuf>,
        pack_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            cache,
            profile,
            workflow_path: workflow_path.into(),
            pack_root: pack_root.into(),
            invoker: Box::new(SelfExecInvoker::current()?),
            loader: Box::new(FileResultLoader),
            workdirs: Box::new(WorktreeManager::from_profile(profile)?),
        })
    }

    pub fn with_invoker(mut self, invoker: impl WorkerInvoker + 'a) -> Self {
        self.invoker = Box::new(invoker);
        self
    }

    pub fn with_loader(mut self, loader: impl ResultLoader + 'a) -> Self {
        self.loader = Box::new(loader);
        self
    }

    pub fn with_workdirs(mut self, workdirs: impl WorkdirProvider + 'a) -> Self {
        self.workdirs = Box::new(workdirs);
        self
    }

    fn ensure_runnable(&self, role: Role) -> Result<()> {
        self.profile.ensure_enabled(role)?;
        if self.profile.outbox.backend != SUPPORTED_BACKEND {
            bail!(
                "unsupported outbox backend '{}' (expected '{SUPPORTED_BACKEND}')",
                self.profile.outbox.backend
            );
        }
        Ok(())
    }

    /// Run one tick.
    #[instrument(skip_all, fields(role = %request.role))]
    pub fn sync(&self, request: &SyncRequest) -> Result<SyncReport> {
        let role = request.role;
        self.ensure_runnable(role)?;
        if request.event_batch == 0 {
            return Err(invalid!("event batch must be greater than zero"));
        }
        let group = self.profile.group_for(role);
        let lead = request.lead_actor();

        let cursor_key = keys::cursor(role);
        let cursor_before = get_i64(self.cache, &cursor_key).context("read sync cursor")?;
        let (events, listened, assigned) = self.store.read(|tx| {
            Ok((
                tx.events_after(cursor_before, request.event_batch)?,
                tx.open_issues_with_any_label(&group.listen_labels)?,
                tx.open_issues_assigned_to(&lead)?,
            ))
        })?;
        let cursor_after = events
            .iter()
            .map(|event| event.id)
            .max()
            .unwrap_or(cursor_before)
            .max(cursor_before);
        let candidates: BTreeSet<IssueRef> = events
            .iter()
            .map(|event| event.issue_ref)
            .chain(listened)
            .chain(assigned)
            .collect();
        debug!(
            cursor_before,
            cursor_after,
            events = events.len(),
            candidates = candidates.len(),
            "collected candidates"
        );

        let ctx = TickContext {
            role,
            lead,
            cursor: cursor_after,
            trigger: "sync",
            force: false,
            writeback: group.writeback,
        };
        let mut admission = Admission::new(group.spawn_cap());
        let mut report = SyncReport {
            cursor_before,
            cursor_after: cursor_before,
            candidates: candidates.len(),
            ..SyncReport::default()
        };
        for issue in candidates {
            let outcome = self.drive_issue(&ctx, issue, &mut admission)?;
            debug!(%issue, ?outcome, "issue driven");
            report.record(&outcome);
        }

        if cursor_after > cursor_before {
            self.cache
                .set(&cursor_key, &cursor_after.to_string())
                .context("persist sync cursor")?;
        }
        report.cursor_after = cursor_after;
        info!(
            candidates = report.candidates,
            processed = report.processed,
            blocked = report.blocked,
            spawned = report.spawned,
            skipped = report.skipped,
            "sync tick finished"
        );
        Ok(report)
    }

    /// Drive a single issue for `role`, bypassing the state-based skip.
    #[instrument(skip_all, fields(%role, %issue))]
    pub fn dispatch(&self, role: Role, issue: IssueRef, assignee: Option<&str>) -> Result<IssueOutcome> {
        self.ensure_runnable(role)?;
        let group = self.profile.group_for(role);
        let request = SyncRequest {
            assignee: assignee.map(str::to_string),
            ..SyncRequest::new(role)
        };
        let cursor = get_i64(self.cache, &keys::cursor(role)).context("read sync cursor")?;
        let ctx = TickContext {
            role,
            lead: request.lead_actor(),
            cursor,
            trigger: "force-spawn",
            force: true,
            writeback: group.writeback,
        };
        let mut admission = Admission::new(group.spawn_cap());
        self.drive_issue(&ctx, issue, &mut admission)
    }
}
