//! Workflow profile (TOML) consumed by every engine component.
//!
//! The file is edited by humans, so missing tables fall back to defaults and
//! an explicit [`WorkflowProfile::validate`] pass rejects unsupported values
//! before anything runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::labels::route_label;
use crate::core::types::Role;

pub const SUPPORTED_VERSION: u32 = 2;
pub const SUPPORTED_BACKEND: &str = "sqlite";
pub const WORKDIR_BACKEND: &str = "git-worktree";
pub const WORKDIR_CLEANUP: &str = "immediate";
pub const DEFAULT_EXECUTOR_TIMEOUT_SECS: u64 = 1800;

/// Parsed workflow profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowProfile {
    pub version: u32,
    pub roles: RolesConfig,
    pub outbox: OutboxConfig,
    /// Repo key -> path (relative paths resolve against the profile's directory).
    pub repos: BTreeMap<String, PathBuf>,
    /// Role name -> repo key.
    pub role_repo: BTreeMap<String, String>,
    pub groups: BTreeMap<String, GroupConfig>,
    /// Role name -> executor.
    pub executors: BTreeMap<String, ExecutorConfig>,
    pub workdir: WorkdirConfig,
    pub webhook: WebhookConfig,

    /// Directory the profile was loaded from.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RolesConfig {
    pub enabled: Vec<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutboxConfig {
    pub backend: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            backend: SUPPORTED_BACKEND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    #[default]
    Owner,
    Subscriber,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Writeback {
    #[default]
    Full,
    CommentOnly,
}

/// Per-role group policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupConfig {
    pub role: Role,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub mode: GroupMode,
    #[serde(default)]
    pub writeback: Writeback,
    #[serde(default)]
    pub listen_labels: Vec<String>,
}

impl GroupConfig {
    /// Group used for a role the profile does not configure explicitly.
    pub fn default_for(role: Role) -> Self {
        Self {
            role,
            max_concurrent: default_max_concurrent(),
            mode: GroupMode::Owner,
            writeback: Writeback::Full,
            listen_labels: vec![route_label(role)],
        }
    }

    /// Spawn cap per tick; never below one.
    pub fn spawn_cap(&self) -> usize {
        self.max_concurrent.max(1) as usize
    }
}

fn default_max_concurrent() -> u32 {
    1
}

/// Command a worker runs for its role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: "go".to_string(),
            args: vec!["test".to_string(), "./...".to_string()],
            timeout_seconds: DEFAULT_EXECUTOR_TIMEOUT_SECS,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Human-readable command line, e.g. `go test ./...`.
    pub fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Sandbox policy for worker execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkdirConfig {
    pub enabled: bool,
    pub backend: String,
    pub root: PathBuf,
    pub cleanup: String,
    pub roles: Vec<Role>,
}

impl Default for WorkdirConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: WORKDIR_BACKEND.to_string(),
            root: PathBuf::from(".outbox/workdirs"),
            cleanup: WORKDIR_CLEANUP.to_string(),
            roles: Vec::new(),
        }
    }
}

/// Webhook shared secrets, referenced by environment variable name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhookConfig {
    pub github_secret_env: Option<String>,
    pub gitlab_token_env: Option<String>,
}

impl WebhookConfig {
    pub fn github_secret(&self) -> Option<String> {
        read_secret_env(self.github_secret_env.as_deref())
    }

    pub fn gitlab_token(&self) -> Option<String> {
        read_secret_env(self.gitlab_token_env.as_deref())
    }
}

fn read_secret_env(name: Option<&str>) -> Option<String> {
    let value = std::env::var(name?.trim()).ok()?;
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

impl Default for WorkflowProfile {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION,
            roles: RolesConfig::default(),
            outbox: OutboxConfig::default(),
            repos: BTreeMap::new(),
            role_repo: BTreeMap::new(),
            groups: BTreeMap::new(),
            executors: BTreeMap::new(),
            workdir: WorkdirConfig::default(),
            webhook: WebhookConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl WorkflowProfile {
    pub fn validate(&self) -> Result<()> {
        if self.version != SUPPORTED_VERSION {
            return Err(anyhow!(
                "unsupported workflow version {} (expected {SUPPORTED_VERSION})",
                self.version
            ));
        }
        if self.outbox.backend != SUPPORTED_BACKEND {
            return Err(anyhow!(
                "unsupported outbox.backend '{}' (expected '{SUPPORTED_BACKEND}')",
                self.outbox.backend
            ));
        }
        if self.roles.enabled.is_empty() {
            return Err(anyhow!("roles.enabled must list at least one role"));
        }
        let mut group_roles = BTreeSet::new();
        for (name, group) in &self.groups {
            if !group_roles.insert(group.role) {
                return Err(anyhow!(
                    "groups.{name}: role '{}' already has a group",
                    group.role
                ));
            }
            if group.mode == GroupMode::Subscriber && group.writeback != Writeback::CommentOnly {
                return Err(anyhow!(
                    "groups.{name}: subscriber mode requires writeback = \"comment-only\""
                ));
            }
        }
        for (role, executor) in &self.executors {
            role.parse::<Role>()
                .map_err(|err| anyhow!("executors.{role}: {err}"))?;
            if executor.program.trim().is_empty() {
                return Err(anyhow!("executors.{role}.program must be non-empty"));
            }
            if executor.timeout_seconds == 0 {
                return Err(anyhow!("executors.{role}.timeout_seconds must be > 0"));
            }
        }
        for (role, key) in &self.role_repo {
            role.parse::<Role>()
                .map_err(|err| anyhow!("role_repo.{role}: {err}"))?;
            if !self.repos.contains_key(key) {
                return Err(anyhow!("role_repo.{role} references unknown repo '{key}'"));
            }
        }
        if self.workdir.enabled {
            if self.workdir.backend != WORKDIR_BACKEND {
                return Err(anyhow!(
                    "unsupported workdir.backend '{}' (expected '{WORKDIR_BACKEND}')",
                    self.workdir.backend
                ));
            }
            if self.workdir.cleanup != WORKDIR_CLEANUP {
                return Err(anyhow!(
                    "unsupported workdir.cleanup '{}' (expected '{WORKDIR_CLEANUP}')",
                    self.workdir.cleanup
                ));
            }
            if self.workdir.root.as_os_str().is_empty() {
                return Err(anyhow!("workdir.root must be set when workdir is enabled"));
            }
            for role in &self.workdir.roles {
                if !self.is_enabled(*role) {
                    return Err(anyhow!("workdir.roles lists disabled role '{role}'"));
                }
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self, role: Role) -> bool {
        self.roles.enabled.contains(&role)
    }

    pub fn ensure_enabled(&self, role: Role) -> Result<()> {
        if !self.is_enabled(role) {
            return Err(anyhow!("role '{role}' is not enabled in roles.enabled"));
        }
        Ok(())
    }

    /// Group policy for a role (explicit group or the default).
    pub fn group_for(&self, role: Role) -> GroupConfig {
        self.groups
            .values()
            .find(|group| group.role == role)
            .cloned()
            .unwrap_or_else(|| GroupConfig::default_for(role))
    }

    pub fn executor_for(&self, role: Role) -> ExecutorConfig {
        self.executors
            .get(role.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Repo key for a role; `default` when unmapped.
    pub fn repo_key(&self, role: Role) -> &str {
        self.role_repo
            .get(role.as_str())
            .map(String::as_str)
            .unwrap_or("default")
    }

    /// Resolved repo directory for a role (profile directory when unmapped).
    pub fn repo_dir(&self, role: Role) -> PathBuf {
        match self
            .role_repo
            .get(role.as_str())
            .and_then(|key| self.repos.get(key)) {
            Some(path) => self.resolve(path),
            None => self.base_dir.clone(),
        }
    }

    pub fn workdir_root(&self) -> PathBuf {
        self.resolve(&self.workdir.root)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

/// Load and validate a workflow profile.
pub fn load_profile(path: &Path) -> Result<WorkflowProfile> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut profile = parse_profile(&contents).with_context(|| format!("parse {}", path.display()))?;
    profile.base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(profile)
}

/// Parse and validate profile text. `base_dir` is left at `.`.
pub fn parse_profile(contents: &str) -> Result<WorkflowProfile> {
    let profile: WorkflowProfile = toml::from_str(contents).context("parse workflow toml")?;
    profile.validate()?;
    Ok(profile)
}
