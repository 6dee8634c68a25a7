//! Lexical confinement of tool paths to the sandbox root.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// A requested path resolves outside the sandbox root.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("path outside sandbox: '{requested}'")]
pub struct SandboxViolation {
    pub requested: String,
}

/// Resolve `requested` against `root` without touching the filesystem.
///
/// Relative paths are joined onto `root`; absolute paths are accepted only when
/// they already lie under `root`. `..` segments are folded lexically and any
/// path that climbs above `root` is rejected. `root` must be absolute and
/// normalized (the sandbox root is canonicalized once at startup).
pub fn confine(root: &Path, requested: &str) -> Result<PathBuf, SandboxViolation> {
    let violation = || SandboxViolation {
        requested: requested.to_string(),
    };

    let requested_path = Path::new(requested);
    let (mut resolved, tail) = if requested_path.is_absolute() {
        let Ok(tail) = requested_path.strip_prefix(root) else {
            return Err(violation());
        };
        (root.to_path_buf(), tail)
    } else {
        (root.to_path_buf(), requested_path)
    };

    let mut depth = 0usize;
    for component in tail.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(violation());
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(violation()),
        }
    }
    Ok(resolved)
}

/// Render `path` relative to `root` for display (falls back to the full path).
pub fn display_relative(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/work/project")
    }

    /// Verifies relative paths resolve under the root.
    #[test]
    fn relative_paths_join_the_root() {
        assert_eq!(
            confine(&root(), "src/main.js").expect("inside"),
            PathBuf::from("/work/project/src/main.js")
        );
        assert_eq!(confine(&root(), ".").expect("root"), root());
        assert_eq!(confine(&root(), "").expect("root"), root());
    }

    /// Verifies `..` inside the root folds lexically.
    #[test]
    fn inner_parent_segments_fold() {
        assert_eq!(
            confine(&root(), "src/../README.md").expect("inside"),
            PathBuf::from("/work/project/README.md")
        );
    }

    /// Verifies `..` above the root is a sandbox violation.
    #[test]
    fn traversal_above_root_is_rejected() {
        let err = confine(&root(), "../../etc/passwd").expect_err("outside");
        assert_eq!(err.requested, "../../etc/passwd");
        assert!(err.to_string().contains("path outside sandbox"));
        assert!(confine(&root(), "src/../../x").is_err());
    }

    /// Verifies absolute paths are accepted only under the root.
    #[test]
    fn absolute_paths_must_stay_under_root() {
        assert_eq!(
            confine(&root(), "/work/project/a.txt").expect("inside"),
            PathBuf::from("/work/project/a.txt")
        );
        assert!(confine(&root(), "/etc/passwd").is_err());
        assert!(confine(&root(), "/work/project-other/a.txt").is_err());
        assert!(confine(&root(), "/work/project/../x").is_err());
    }

    #[test]
    fn display_relative_strips_root() {
        let path = root().join("src/app.js");
        assert_eq!(display_relative(&root(), &path), "src/app.js");
        assert_eq!(display_relative(&root(), &root()), ".");
    }
}
