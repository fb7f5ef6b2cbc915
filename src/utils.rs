//! Utility functions for process execution and scheduler output parsing.

use crate::error::{PipelineError, Result};
use regex::Regex;
use std::fmt;
use std::process::Command;
use tracing::trace;

/// Result of running a local command
#[derive(Debug)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

/// Execute a local command and return stdout, stderr, and return code.
///
/// A non-zero return code is not an error here; callers decide what it means.
pub fn run_command(program: &str, args: &[String]) -> Result<CommandResult> {
    trace!("Running command: {} {:?}", program, args);

    let output = Command::new(program).args(args).output()?;

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        return_code: output.status.code().unwrap_or(-1),
    })
}

/// Split command output into lines with trailing whitespace removed.
pub fn output_lines(text: &str) -> Vec<String> {
    text.lines().map(|l| l.trim_end().to_string()).collect()
}

/// Identifier assigned by the remote scheduler to one submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extracts job identifiers from scheduler output.
///
/// An identifier is the token right before one of the host suffixes
/// (e.g. `12345.awon-mgr` or `12345[].awon-mgr`), with array-job brackets
/// trimmed off. Lines without a known suffix yield nothing.
#[derive(Debug, Clone)]
pub struct JobIdParser {
    pattern: Regex,
}

impl JobIdParser {
    pub fn new(host_suffixes: &[String]) -> Result<Self> {
        let suffixes: Vec<String> = host_suffixes
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| regex::escape(s))
            .collect();
        if suffixes.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one scheduler host suffix is required".to_string(),
            ));
        }

        let pattern = Regex::new(&format!(r"([^\s.]+?)(?:{})", suffixes.join("|")))
            .map_err(|e| PipelineError::InvalidConfig(format!("bad host suffix: {}", e)))?;
        Ok(Self { pattern })
    }

    /// Parse a single line, returning the job id or `None`.
    pub fn parse_line(&self, line: &str) -> Option<JobId> {
        let caps = self.pattern.captures(line)?;
        let id = caps.get(1)?.as_str().trim_matches(|c| c == '[' || c == ']');
        if id.is_empty() {
            None
        } else {
            Some(JobId::new(id))
        }
    }
}

/// Last path component of a remote path (remote paths are always `/`-separated).
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Base name with its final extension removed.
pub fn file_stem(path: &str) -> &str {
    let name = base_name(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// Join a remote directory and a child name.
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./~:=+,".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
