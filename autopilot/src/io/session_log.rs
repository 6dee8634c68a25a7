//! Per-session product log.
//!
//! Every line carries an RFC3339 UTC timestamp, is appended to
//! `.autopilot/logs/session-<n>.log` and mirrored to stdout. Logging never
//! fails a session: write errors are reported through tracing and dropped.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::warn;

#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    file: Option<File>,
    echo: bool,
    output_chars: usize,
}

impl SessionLog {
    /// Open (append) the log at `path`. `echo` mirrors lines to stdout.
    pub fn open(path: &Path, echo: bool, output_chars: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open session log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            echo,
            output_chars,
        })
    }

    /// A log that writes nowhere; used when the log file cannot be opened.
    pub fn disabled(echo: bool, output_chars: usize) -> Self {
        Self {
            path: PathBuf::new(),
            file: None,
            echo,
            output_chars,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&mut self, message: impl AsRef<str>) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut written = String::new();
        for text in message.as_ref().lines() {
            written.push_str(&format!("[{stamp}] {text}\n"));
        }
        if written.is_empty() {
            written = format!("[{stamp}]\n");
        }
        if self.echo {
            print!("{written}");
        }
        if let Some(file) = self.file.as_mut()
            && let Err(err) = file.write_all(written.as_bytes())
        {
            warn!(path = %self.path.display(), err = %err, "session log write failed");
        }
    }

    pub fn thinking(&mut self, elapsed: Duration) {
        self.line(format!("engine responded after {:.1}s", elapsed.as_secs_f64()));
    }

    pub fn tool_result(&mut self, tool: &str, duration_ms: u64, success: bool, output: &str) {
        let status = if success { "ok" } else { "failed" };
        self.line(format!(
            "tool {tool} {status} in {duration_ms}ms: {}",
            truncate_chars(output, self.output_chars)
        ));
    }
}

/// Truncate to `max_chars` characters, noting how much was dropped.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}... [{} more chars]", count - max_chars)
}
