//! Test-only fixtures and scripted collaborators.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::types::{Changes, Issue, IssueRef, LabelSet, TestReport, WorkOrder, WorkResult};
use crate::io::cache::KvCache;
use crate::io::codex::{CodexRunner, StepKind, StepRequest, StepResult, StepStatus};
use crate::io::invoker::{Invocation, WorkerInvoker};
use crate::io::work_result::write_work_result_json;

/// Open, claimed issue with the given labels and an empty body.
pub fn issue_fixture(id: i64, labels: &[&str]) -> Issue {
    Issue {
        issue_ref: IssueRef(id),
        title: format!("issue {id}"),
        body: String::new(),
        assignee: Some("lead-backend".to_string()),
        closed: false,
        created_at: "2026-10-16T00:00:00Z".to_string(),
        updated_at: "2026-10-16T00:00:00Z".to_string(),
        closed_at: None,
        labels: labels.iter().map(|label| label.to_string()).collect::<LabelSet>(),
    }
}

/// In-memory cache. Writes to keys under a configured prefix fail.
#[derive(Debug, Default)]
pub struct MemoryCache {
    values: Mutex<BTreeMap<String, String>>,
    failing_prefix: Mutex<Option<String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `set` on a key starting with `prefix` fail.
    pub fn fail_writes_under(&self, prefix: &str) {
        if let Ok(mut slot) = self.failing_prefix.lock() {
            *slot = Some(prefix.to_string());
        }
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }
}

impl KvCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().map_err(|_| anyhow!("cache lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let failing = self
            .failing_prefix
            .lock()
            .map_err(|_| anyhow!("cache lock poisoned"))?
            .clone();
        if let Some(prefix) = failing
            && key.starts_with(&prefix)
        {
            bail!("injected cache write failure for {key}");
        }
        let mut values = self.values.lock().map_err(|_| anyhow!("cache lock poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Result a well-behaved worker reports for `order`.
pub fn passing_result(order: &WorkOrder) -> WorkResult {
    WorkResult {
        issue_ref: order.issue_ref.clone(),
        run_id: order.run_id.clone(),
        changes: Changes {
            pr: String::new(),
            commit: "git:abc123".to_string(),
        },
        tests: TestReport {
            command: "go test ./...".to_string(),
            result: "pass".to_string(),
            evidence: "exit status 0".to_string(),
        },
        result_code: None,
    }
}

type WorkerScript<'s> = Box<dyn FnMut(&Invocation<'_>) -> Result<()> + 's>;

/// Worker invoker that plays queued scripts instead of spawning processes.
#[derive(Default)]
pub struct ScriptedInvoker<'s> {
    scripts: Mutex<VecDeque<WorkerScript<'s>>>,
    orders: Mutex<Vec<WorkOrder>>,
}

impl<'s> ScriptedInvoker<'s> {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            orders: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, script: impl FnMut(&Invocation<'_>) -> Result<()> + 's) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push_back(Box::new(script));
        }
        self
    }

    /// Write `result(order)` as `work_result.json` and exit cleanly.
    pub fn then_write(self, mut result: impl FnMut(&WorkOrder) -> WorkResult + 's) -> Self {
        self.then(move |invocation| {
            write_work_result_json(
                &invocation.pack.work_result_json(),
                &result(invocation.order),
            )
        })
    }

    pub fn then_pass(self) -> Self {
        self.then_write(passing_result)
    }

    /// Simulate a worker process that failed to run.
    pub fn then_fail(self, message: &'s str) -> Self {
        self.then(move |_| Err(anyhow!("{message}")))
    }

    /// Work orders seen so far, in invocation order.
    pub fn orders(&self) -> Vec<WorkOrder> {
        self.orders
            .lock()
            .map(|orders| orders.clone())
            .unwrap_or_default()
    }
}

impl WorkerInvoker for ScriptedInvoker<'_> {
    fn invoke(&self, invocation: &Invocation<'_>) -> Result<()> {
        self.orders
            .lock()
            .map_err(|_| anyhow!("orders lock poisoned"))?
            .push(invocation.order.clone());
        let script = self
            .scripts
            .lock()
            .map_err(|_| anyhow!("scripts lock poisoned"))?
            .pop_front();
        let mut script = script.ok_or_else(|| anyhow!("no scripted worker left"))?;
        script(invocation)
    }
}

/// Codex runner that replays `(kind, passed)` outcomes in order.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: Mutex<VecDeque<(StepKind, bool)>>,
    calls: Mutex<Vec<StepRequest>>,
}

impl ScriptedRunner {
    pub fn new(script: impl IntoIterator<Item = (StepKind, bool)>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<StepRequest> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

impl CodexRunner for ScriptedRunner {
    fn run_step(&self, request: &StepRequest) -> Result<StepResult> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("calls lock poisoned"))?
            .push(request.clone());
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front();
        let Some((kind, passed)) = next else {
            bail!("no scripted {} step left", request.kind);
        };
        if kind != request.kind {
            bail!("scripted {kind} step, got {}", request.kind);
        }
        let verdict = if passed { "pass" } else { "fail" };
        Ok(StepResult {
            status: if passed {
                StepStatus::Pass
            } else {
                StepStatus::Fail
            },
            summary: format!("{kind} round {} {verdict}", request.round),
            evidence: Vec::new(),
        })
    }
}

/// Temporary git repository with one commit. The repo lives in `repo/`
/// under a temp root so sandboxes and packs can sit next to it.
#[derive(Debug)]
pub struct TestRepo {
    root: TempDir,
    repo: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let root = tempfile::tempdir().context("create temp root")?;
        let repo = root.path().join("repo");
        fs::create_dir_all(&repo).with_context(|| format!("create {}", repo.display()))?;
        let test_repo = Self { root, repo };
        test_repo.git(&["init", "--quiet"])?;
        test_repo.git(&["config", "user.email", "test@example.com"])?;
        test_repo.git(&["config", "user.name", "test"])?;
        test_repo.write("README.md", "hi\n")?;
        test_repo.git(&["add", "README.md"])?;
        test_repo.git(&["commit", "--quiet", "-m", "chore: init"])?;
        Ok(test_repo)
    }

    pub fn path(&self) -> &Path {
        &self.repo
    }

    /// Directory next to the repo, for sandboxes and packs.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.repo.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .status()
            .with_context(|| format!("run git {}", args.join(" ")))?;
        if !status.success() {
            bail!("git {} failed with {status}", args.join(" "));
        }
        Ok(())
    }
}
