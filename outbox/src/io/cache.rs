//! Small string key/value cache for cursors, active-run tokens and run
//! sequence counters.
//!
//! Not transactional and not part of the issue store: callers treat a failed
//! write as fatal to the current operation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::types::{IssueRef, Role};
use crate::io::write_atomic;

pub trait KvCache {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Cache key layout.
pub mod keys {
    use super::{IssueRef, Role};

    pub fn cursor(role: Role) -> String {
        format!("lead:{role}:cursor:event_id")
    }

    pub fn active_run(role: Role, issue: IssueRef) -> String {
        format!("lead:{role}:active_run:{issue}")
    }

    pub fn run_seq(role: Role, issue: IssueRef) -> String {
        format!("lead:{role}:run_seq:{issue}")
    }
}

/// Flat JSON object on disk, rewritten atomically (temp file + rename) on
/// every `set`.
#[derive(Debug)]
pub struct JsonFileCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileCache {
    /// Open the cache file, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read cache {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parse cache {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvCache for JsonFileCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("cache lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("cache lock poisoned"))?;
        let mut next = entries.clone();
        next.insert(key.to_string(), value.to_string());
        let mut buf = serde_json::to_string_pretty(&next)?;
        buf.push('\n');
        write_atomic(&self.path, &buf)?;
        *entries = next;
        debug!(key, value, "cache updated");
        Ok(())
    }
}

/// Read an integer-valued key; missing means zero.
pub fn get_i64(cache: &dyn KvCache, key: &str) -> Result<i64> {
    match cache.get(key)? {
        None => Ok(0),
        Some(raw) if raw.trim().is_empty() => Ok(0),
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("cache key {key} holds non-integer '{raw}'")),
    }
}
