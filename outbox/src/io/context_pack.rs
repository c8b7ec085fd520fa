//! Context pack: the file bundle handed to a worker process.
//!
//! ```text
//! <pack>/
//!   work_order.json     IssueRef, RunID, Role, RepoDir
//!   spec_snapshot.md    issue body at dispatch time
//!   constraints.md      fixed hard constraints
//!   links.md            IssueRef + read cursor
//!   work_result.json    written by the worker (or work_result.txt)
//!   stdout.log          worker stdout
//!   stderr.log          worker stderr
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::types::WorkOrder;

pub const WORK_ORDER_FILE: &str = "work_order.json";
pub const SPEC_SNAPSHOT_FILE: &str = "spec_snapshot.md";
pub const CONSTRAINTS_FILE: &str = "constraints.md";
pub const LINKS_FILE: &str = "links.md";
pub const WORK_RESULT_JSON: &str = "work_result.json";
pub const WORK_RESULT_TXT: &str = "work_result.txt";
pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

const CONSTRAINTS: &str = "\
# Constraints

- Keep IssueRef and RunID exactly as given in work_order.json; echo both in the result.
- Provide evidence: Changes (PR or Commit) and Tests (Command, Result, Evidence).
- Write the result to work_result.json in this directory.
";

/// Well-known paths inside one context pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPack {
    dir: PathBuf,
}

impl ContextPack {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn work_order(&self) -> PathBuf {
        self.dir.join(WORK_ORDER_FILE)
    }

    pub fn spec_snapshot(&self) -> PathBuf {
        self.dir.join(SPEC_SNAPSHOT_FILE)
    }

    pub fn constraints(&self) -> PathBuf {
        self.dir.join(CONSTRAINTS_FILE)
    }

    pub fn links(&self) -> PathBuf {
        self.dir.join(LINKS_FILE)
    }

    pub fn work_result_json(&self) -> PathBuf {
        self.dir.join(WORK_RESULT_JSON)
    }

    pub fn work_result_txt(&self) -> PathBuf {
        self.dir.join(WORK_RESULT_TXT)
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.dir.join(STDOUT_LOG)
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.dir.join(STDERR_LOG)
    }

    pub fn read_work_order(&self) -> Result<WorkOrder> {
        let path = self.work_order();
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read work order {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse work order {}", path.display()))
    }
}

/// `e<N>` for a positive cursor, `none` otherwise.
pub fn format_read_cursor(cursor: i64) -> String {
    if cursor > 0 {
        format!("e{cursor}")
    } else {
        "none".to_string()
    }
}

/// Create the pack directory and write the four input files.
///
/// Files are not rolled back on partial failure; a fresh run id gets a fresh
/// directory.
#[instrument(skip_all, fields(dir = %dir.display(), run_id = %order.run_id))]
pub fn write_context_pack(
    dir: &Path,
    order: &WorkOrder,
    spec_snapshot: &str,
    read_cursor: i64,
) -> Result<ContextPack> {
    fs::create_dir_all(dir).with_context(|| format!("create context pack {}", dir.display()))?;
    let pack = ContextPack::new(dir);

    let mut order_json = serde_json::to_string_pretty(order)?;
    order_json.push('\n');
    write(&pack.work_order(), &order_json)?;
    write(&pack.spec_snapshot(), spec_snapshot)?;
    write(&pack.constraints(), CONSTRAINTS)?;
    let links = format!(
        "IssueRef: {}\nReadUpTo: {}\n",
        order.issue_ref,
        format_read_cursor(read_cursor)
    );
    write(&pack.links(), &links)?;
    debug!("context pack written");
    Ok(pack)
}

fn write(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Role;

    fn order() -> WorkOrder {
        WorkOrder {
            issue_ref: "local#3".to_string(),
            run_id: "20261016-backend-1".to_string(),
            role: Role::Backend,
            repo_dir: "/repo".to_string(),
        }
    }

    #[test]
    fn read_cursor_formatting() {
        assert_eq!(format_read_cursor(0), "none");
        assert_eq!(format_read_cursor(-1), "none");
        assert_eq!(format_read_cursor(42), "e42");
    }

    #[test]
    fn pack_contains_all_inputs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pack = write_context_pack(&temp.path().join("pack"), &order(), "## Goal\nship", 7)
            .expect("write");
        assert_eq!(pack.read_work_order().expect("order"), order());
        assert_eq!(
            fs::read_to_string(pack.spec_snapshot()).expect("spec"),
            "## Goal\nship"
        );
        assert!(
            fs::read_to_string(pack.constraints())
                .expect("constraints")
                .contains("Keep IssueRef and RunID")
        );
        assert_eq!(
            fs::read_to_string(pack.links()).expect("links"),
            "IssueRef: local#3\nReadUpTo: e7\n"
        );
    }

    #[test]
    fn work_order_uses_canonical_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pack = write_context_pack(temp.path(), &order(), "", 0).expect("write");
        let raw = fs::read_to_string(pack.work_order()).expect("read");
        for key in ["\"IssueRef\"", "\"RunID\"", "\"Role\"", "\"RepoDir\""] {
            assert!(raw.contains(key), "missing {key}");
        }
    }
}
