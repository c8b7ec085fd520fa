//! Side-effecting adapters: store, cache, filesystem, git and subprocesses.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub mod cache;
pub mod codex;
pub mod config;
pub mod context_pack;
pub mod git;
pub mod invoker;
pub mod process;
pub mod store;
pub mod work_result;
pub mod workdir;

/// Atomically replace `path` with `contents` (temp file + rename).
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
