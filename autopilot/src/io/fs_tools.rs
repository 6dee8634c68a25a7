//! Filesystem tool handlers. Every path is confined to the sandbox root.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument};

use crate::core::sandbox_path::{SandboxViolation, confine, display_relative};

/// Root-level names the agent may not write to.
const RESERVED: &[&str] = &[".autopilot", ".autopilot.lock", ".git"];

/// Confine `requested` lexically, then make sure no existing symlink on the
/// way leads out of `root`.
pub fn resolve(root: &Path, requested: &str) -> Result<PathBuf> {
    let resolved = confine(root, requested)?;
    let mut existing = resolved.as_path();
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    let canonical = existing
        .canonicalize()
        .with_context(|| format!("resolve {}", existing.display()))?;
    if !canonical.starts_with(root) {
        return Err(SandboxViolation {
            requested: requested.to_string(),
        }
        .into());
    }
    Ok(resolved)
}

#[instrument(skip_all, fields(path = requested))]
pub fn read_file(root: &Path, requested: &str, limit_bytes: usize) -> Result<String> {
    let path = resolve(root, requested)?;
    if !path.is_file() {
        bail!("'{requested}' is not a file");
    }
    let bytes = fs::read(&path).with_context(|| format!("read '{requested}'"))?;
    let mut text = String::from_utf8_lossy(&bytes[..bytes.len().min(limit_bytes)]).into_owned();
    if bytes.len() > limit_bytes {
        text.push_str(&format!(
            "\n[file truncated: showing {limit_bytes} of {} bytes]",
            bytes.len()
        ));
    }
    debug!(bytes = bytes.len(), "file read");
    Ok(text)
}

/// Write `content` atomically (temp file + rename), creating parent
/// directories. Returns the path relative to `root`.
#[instrument(skip_all, fields(path = requested, bytes = content.len()))]
pub fn write_file(root: &Path, requested: &str, content: &str) -> Result<PathBuf> {
    let path = resolve(root, requested)?;
    let relative = path
        .strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| anyhow!("'{requested}' is outside the project"))?;
    let first = relative
        .components()
        .next()
        .ok_or_else(|| anyhow!("'{requested}' names the project root, not a file"))?;
    if RESERVED.iter().any(|name| first.as_os_str() == *name) {
        bail!("'{requested}' is reserved for the supervisor");
    }
    if path.is_dir() {
        bail!("'{requested}' is a directory");
    }
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("'{requested}' has no parent directory"))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory for '{requested}'"))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("'{requested}' has no file name"))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, content).with_context(|| format!("write '{requested}'"))?;
    fs::rename(&tmp_path, &path).with_context(|| format!("replace '{requested}'"))?;
    debug!("file written");
    Ok(relative)
}

#[instrument(skip_all, fields(path = requested))]
pub fn list_directory(root: &Path, requested: &str) -> Result<String> {
    let path = resolve(root, requested)?;
    if !path.is_dir() {
        bail!("'{requested}' is not a directory");
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(&path).with_context(|| format!("list '{requested}'"))? {
        let entry = entry.with_context(|| format!("list '{requested}'"))?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        entries.push(name);
    }
    entries.sort();
    if entries.is_empty() {
        return Ok(format!("{} is empty", display_relative(root, &path)));
    }
    Ok(entries.join("\n"))
}

/// Read several files; per-file failures are reported inline.
pub fn batch_read_files(root: &Path, paths: &[String], limit_bytes: usize) -> Result<String> {
    batch(paths, |path| read_file(root, path, limit_bytes))
}

/// List several directories; per-directory failures are reported inline.
pub fn batch_list_directories(root: &Path, paths: &[String]) -> Result<String> {
    batch(paths, |path| list_directory(root, path))
}

fn batch(paths: &[String], mut handle: impl FnMut(&str) -> Result<String>) -> Result<String> {
    if paths.is_empty() {
        bail!("paths must not be empty");
    }
    let sections: Vec<String> = paths
        .iter()
        .map(|path| match handle(path) {
            Ok(body) => format!("=== {path} ===\n{body}"),
            Err(err) => format!("=== {path} ===\n[failed: {err:#}]"),
        })
        .collect();
    Ok(sections.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> (tempfile::TempDir, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().canonicalize().expect("canonical");
        (temp, root)
    }

    /// Verifies a nested write reads back without leaving a staging file.
    #[test]
    fn write_then_read_inside_root() {
        let (_temp, root) = project();
        let written = write_file(&root, "src/app.js", "console.log(1);\n").expect("write");
        assert_eq!(written, PathBuf::from("src/app.js"));
        assert_eq!(
            read_file(&root, "src/app.js", 1024).expect("read"),
            "console.log(1);\n"
        );
        assert!(!root.join("src/.app.js.tmp").exists());
    }

    /// Verifies `..` traversal is refused for reads and writes.
    #[test]
    fn traversal_is_a_sandbox_violation() {
        let (_temp, root) = project();
        let err = read_file(&root, "../../etc/passwd", 1024).expect_err("outside");
        assert!(err.to_string().contains("path outside sandbox"));
        let err = write_file(&root, "../escape.txt", "x").expect_err("outside");
        assert!(err.downcast_ref::<SandboxViolation>().is_some());
        assert!(!root.parent().expect("parent").join("escape.txt").exists());
    }

    /// Verifies a symlink pointing outside the root cannot be followed.
    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let (_temp, root) = project();
        let outside = tempfile::tempdir().expect("outside");
        std::os::unix::fs::symlink(outside.path(), root.join("link")).expect("symlink");
        let err = write_file(&root, "link/evil.txt", "x").expect_err("escape");
        assert!(err.to_string().contains("path outside sandbox"));
        assert!(!outside.path().join("evil.txt").exists());
    }

    /// Verifies the agent cannot write supervisor-owned paths.
    #[test]
    fn supervisor_state_is_reserved() {
        let (_temp, root) = project();
        assert!(write_file(&root, ".autopilot/config.toml", "x").is_err());
        assert!(write_file(&root, ".autopilot.lock", "x").is_err());
        assert!(write_file(&root, ".", "x").is_err());
    }

    /// Verifies large files are truncated with a marker.
    #[test]
    fn read_truncates_large_files() {
        let (_temp, root) = project();
        write_file(&root, "big.txt", &"a".repeat(50)).expect("write");
        let text = read_file(&root, "big.txt", 10).expect("read");
        assert!(text.starts_with("aaaaaaaaaa\n[file truncated"));
    }

    /// Verifies listings are sorted and mark directories.
    #[test]
    fn list_marks_directories_and_sorts() {
        let (_temp, root) = project();
        write_file(&root, "b.txt", "").expect("write");
        write_file(&root, "a/inner.txt", "").expect("write");
        assert_eq!(list_directory(&root, ".").expect("list"), "a/\nb.txt");
        assert!(list_directory(&root, "b.txt").is_err());
    }

    /// Verifies one failing entry does not abort a batch read.
    #[test]
    fn batch_reports_failures_inline() {
        let (_temp, root) = project();
        write_file(&root, "one.txt", "1").expect("write");
        let out = batch_read_files(
            &root,
            &["one.txt".to_string(), "missing.txt".to_string()],
            1024,
        )
        .expect("batch");
        assert!(out.contains("=== one.txt ===\n1"));
        assert!(out.contains("=== missing.txt ===\n[failed:"));
        assert!(batch_list_directories(&root, &[]).is_err());
    }
}
