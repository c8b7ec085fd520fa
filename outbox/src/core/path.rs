//! Path helpers for sandboxed workdirs.
//!
//! Workdir paths do not exist yet when they are checked, so containment is
//! decided lexically rather than through `canonicalize`.

use std::path::{Component, Path, PathBuf};

/// Replace path-hostile characters (`/ \ # :` and space) with `_`.
pub fn sanitize_component(raw: &str) -> String {
    let sanitized: String = raw
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | '#' | ':' | ' ' => '_',
            other => other,
        })
        .collect();
    match sanitized.as_str() {
        "" | "." | ".." => format!("_{sanitized}"),
        _ => sanitized,
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when `target` lies strictly below `root` (the root itself is rejected).
pub fn is_strictly_inside(root: &Path, target: &Path) -> bool {
    let root = lexical_normalize(root);
    let target = lexical_normalize(target);
    target != root && target.starts_with(&root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_hostile_characters() {
        assert_eq!(sanitize_component("local#12"), "local_12");
        assert_eq!(sanitize_component("a/b\\c:d e"), "a_b_c_d_e");
        assert_eq!(sanitize_component("20261016-backend-1"), "20261016-backend-1");
    }

    #[test]
    fn sanitize_never_yields_relative_components() {
        assert_eq!(sanitize_component(".."), "_..");
        assert_eq!(sanitize_component(""), "_");
    }

    #[test]
    fn containment_rejects_root_and_escapes() {
        let root = Path::new("/srv/sandbox");
        assert!(is_strictly_inside(root, Path::new("/srv/sandbox/backend/x")));
        assert!(!is_strictly_inside(root, Path::new("/srv/sandbox")));
        assert!(!is_strictly_inside(root, Path::new("/srv/sandbox/./")));
        assert!(!is_strictly_inside(
            root,
            Path::new("/srv/sandbox/backend/../../etc")
        ));
        assert!(!is_strictly_inside(root, Path::new("/srv/sandboxed/x")));
    }
}
