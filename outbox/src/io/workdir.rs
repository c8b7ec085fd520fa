//! Git-worktree sandboxes for isolated worker execution.
//!
//! Layout: `<root>/<role>/<issue-ref>/<run-id>`, each component sanitized.
//! A dirty worktree is never force-removed: cleanup fails and the directory
//! stays for a human to inspect.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::path::{is_strictly_inside, sanitize_component};
use crate::core::types::{IssueRef, Role};
use crate::io::config::WorkflowProfile;
use crate::io::git::Git;

/// Sandbox lifecycle used by the sync engine.
pub trait WorkdirProvider {
    /// True when workers of this role run inside a sandbox.
    fn enabled_for(&self, role: Role) -> bool;

    /// Materialize a fresh sandbox and return its path.
    fn prepare(&self, role: Role, issue: IssueRef, run_id: &str) -> Result<PathBuf>;

    /// Remove a sandbox. Idempotent when the directory is already gone.
    fn cleanup(&self, role: Role, issue: IssueRef, run_id: &str, path: &Path) -> Result<()>;
}

/// `git worktree` backed sandbox manager.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    enabled: bool,
    root: PathBuf,
    roles: BTreeSet<Role>,
    repos: BTreeMap<Role, PathBuf>,
}

impl WorktreeManager {
    /// Build from the profile's `[workdir]` policy. Paths are made absolute so
    /// `git` subprocesses resolve them the same way regardless of their cwd.
    pub fn from_profile(profile: &WorkflowProfile) -> Result<Self> {
        let root = std::path::absolute(profile.workdir_root())
            .context("resolve workdir root")?;
        let mut repos = BTreeMap::new();
        for role in &profile.workdir.roles {
            let repo = std::path::absolute(profile.repo_dir(*role))
                .with_context(|| format!("resolve repo dir for {role}"))?;
            repos.insert(*role, repo);
        }
        Ok(Self {
            enabled: profile.workdir.enabled,
            root,
            roles: profile.workdir.roles.iter().copied().collect(),
            repos,
        })
    }

    /// A manager that never sandboxes anything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            root: PathBuf::new(),
            roles: BTreeSet::new(),
            repos: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sandbox path for one run, validated to sit strictly inside the root.
    pub fn path_for(&self, role: Role, issue: IssueRef, run_id: &str) -> Result<PathBuf> {
        let path = self
            .root
            .join(sanitize_component(role.as_str()))
            .join(sanitize_component(&issue.to_string()))
            .join(sanitize_component(run_id));
        self.ensure_contained(&path)?;
        Ok(path)
    }

    fn ensure_contained(&self, path: &Path) -> Result<()> {
        if !is_strictly_inside(&self.root, path) {
            bail!(
                "workdir {} is not inside sandbox root {}",
                path.display(),
                self.root.display()
            );
        }
        Ok(())
    }

    fn repo_for(&self, role: Role) -> Result<Git> {
        self.repos
            .get(&role)
            .map(Git::new)
            .ok_or_else(|| anyhow!("no repo configured for workdir role '{role}'"))
    }
}

impl WorkdirProvider for WorktreeManager {
    fn enabled_for(&self, role: Role) -> bool {
        self.enabled && self.roles.contains(&role)
    }

    #[instrument(skip_all, fields(%role, %issue, run_id = %run_id))]
    fn prepare(&self, role: Role, issue: IssueRef, run_id: &str) -> Result<PathBuf> {
        let path = self.path_for(role, issue, run_id)?;
        if path.exists() {
            bail!("workdir {} already exists", path.display());
        }
        let repo = self.repo_for(role)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create workdir parent {}", parent.display()))?;
        }
        if let Err(err) = repo.worktree_add_detached(&path) {
            warn!(err = %err, "worktree add failed, removing partial state");
            if let Err(prune_err) = repo.worktree_prune() {
                warn!(err = %prune_err, "worktree prune failed");
            }
            if path.exists()
                && let Err(rm_err) = fs::remove_dir_all(&path)
            {
                warn!(err = %rm_err, "remove partial workdir failed");
            }
            return Err(err.context(format!("prepare workdir {}", path.display())));
        }
        info!(path = %path.display(), "workdir prepared");
        Ok(path)
    }

    #[instrument(skip_all, fields(%role, %issue, run_id = %run_id, path = %path.display()))]
    fn cleanup(&self, role: Role, issue: IssueRef, run_id: &str, path: &Path) -> Result<()> {
        self.ensure_contained(path)?;
        let repo = self.repo_for(role)?;
        if !path.exists() {
            debug!("workdir already gone, pruning");
            return repo.worktree_prune();
        }
        Git::new(path)
            .ensure_clean()
            .with_context(|| format!("refuse to remove dirty workdir {}", path.display()))?;
        repo.worktree_remove(path)?;
        repo.worktree_prune()?;
        info!("workdir removed");
        Ok(())
    }
}
