//! Worker process invocation.
//!
//! The worker is this same executable re-invoked as
//! `<self> worker run --context-pack <dir> --workflow <file>`. The contract is
//! narrow: inputs are the context pack files, outputs are the result file in
//! the same directory plus the exit status.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use crate::core::types::WorkOrder;
use crate::io::context_pack::ContextPack;
use crate::io::process::run_command_to_files;

pub const ENV_ROLE: &str = "OUTBOX_ROLE";
pub const ENV_ISSUE_REF: &str = "OUTBOX_ISSUE_REF";
pub const ENV_RUN_ID: &str = "OUTBOX_RUN_ID";

/// Extra time the parent grants on top of the executor timeout so the worker
/// can still write its own timeout result.
const WORKER_GRACE: Duration = Duration::from_secs(30);

/// Everything needed to start one worker.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub pack: &'a ContextPack,
    pub order: &'a WorkOrder,
    pub workflow: &'a Path,
    pub timeout: Duration,
}

pub trait WorkerInvoker {
    /// Run the worker to completion. An error means the process could not be
    /// run or did not exit cleanly; the result file is loaded separately.
    fn invoke(&self, invocation: &Invocation<'_>) -> Result<()>;
}

impl<T: WorkerInvoker + ?Sized> WorkerInvoker for &T {
    fn invoke(&self, invocation: &Invocation<'_>) -> Result<()> {
        (**self).invoke(invocation)
    }
}

/// Re-executes the current binary as a worker subprocess.
#[derive(Debug, Clone)]
pub struct SelfExecInvoker {
    exe: PathBuf,
}

impl SelfExecInvoker {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    pub fn current() -> Result<Self> {
        let exe = std::env::current_exe().context("resolve current executable")?;
        Ok(Self::new(exe))
    }
}

impl WorkerInvoker for SelfExecInvoker {
    #[instrument(skip_all, fields(issue = %invocation.order.issue_ref, run_id = %invocation.order.run_id))]
    fn invoke(&self, invocation: &Invocation<'_>) -> Result<()> {
        let order = invocation.order;
        let mut cmd = Command::new(&self.exe);
        cmd.arg("worker")
            .arg("run")
            .arg("--context-pack")
            .arg(invocation.pack.dir())
            .arg("--workflow")
            .arg(invocation.workflow)
            .env(ENV_ROLE, order.role.as_str())
            .env(ENV_ISSUE_REF, &order.issue_ref)
            .env(ENV_RUN_ID, &order.run_id);

        let timeout = invocation.timeout + WORKER_GRACE;
        info!(exe = %self.exe.display(), timeout_secs = timeout.as_secs(), "spawning worker");
        let outcome = run_command_to_files(
            cmd,
            timeout,
            &invocation.pack.stdout_log(),
            &invocation.pack.stderr_log(),
        )
        .context("run worker subprocess")?;
        if outcome.timed_out {
            warn!("worker timed out");
            bail!("worker timed out after {}s", timeout.as_secs());
        }
        if !outcome.status.success() {
            warn!(exit_code = ?outcome.status.code(), "worker failed");
            bail!(
                "worker exited with {} (see {})",
                outcome.status,
                invocation.pack.stderr_log().display()
            );
        }
        Ok(())
    }
}
