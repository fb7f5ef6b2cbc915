//! Scripted `Remote` used by unit tests.

use crate::error::{PipelineError, Result};
use crate::remote::{CommandOutput, Remote};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

/// Replays canned output per command and records everything it was asked to do.
///
/// Each command has a queue of responses; the last one repeats once the
/// queue is down to a single entry. Unknown commands print nothing.
#[derive(Default)]
pub struct FakeRemote {
    responses: RefCell<HashMap<String, VecDeque<CommandOutput>>>,
    pub executed: RefCell<Vec<String>>,
    /// (remote path, file contents) of every successful transfer
    pub transfers: RefCell<Vec<(String, String)>>,
    pub fail_transfers: Cell<bool>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all responses for `command` with a single stdout response.
    pub fn on(&self, command: &str, stdout: &[&str]) {
        self.set(command, vec![out(stdout, &[])]);
    }

    /// Replace all responses for `command` with a single stderr response.
    pub fn on_error(&self, command: &str, stderr: &[&str]) {
        self.set(command, vec![out(&[], stderr)]);
    }

    /// Queue successive stdout responses for `command`.
    pub fn on_sequence(&self, command: &str, outputs: &[&[&str]]) {
        self.set(command, outputs.iter().map(|o| out(o, &[])).collect());
    }

    fn set(&self, command: &str, outputs: Vec<CommandOutput>) {
        self.responses
            .borrow_mut()
            .insert(command.to_string(), outputs.into());
    }

    /// Number of times `command` was executed.
    pub fn count(&self, command: &str) -> usize {
        self.executed
            .borrow()
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    /// Number of executed commands that start with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.executed
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

impl Remote for FakeRemote {
    fn execute(&self, command: &str) -> Result<CommandOutput> {
        self.executed.borrow_mut().push(command.to_string());
        let mut responses = self.responses.borrow_mut();
        let output = match responses.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => CommandOutput::default(),
        };
        Ok(output)
    }

    fn transfer(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        if self.fail_transfers.get() {
            return Err(PipelineError::TransferFailed {
                local: local_path.display().to_string(),
                remote: remote_path.to_string(),
                detail: "scp: connection refused".to_string(),
            });
        }
        let contents = std::fs::read_to_string(local_path)?;
        self.transfers
            .borrow_mut()
            .push((remote_path.to_string(), contents));
        Ok(())
    }
}

fn out(stdout: &[&str], stderr: &[&str]) -> CommandOutput {
    CommandOutput {
        stdout: stdout.iter().map(|s| s.to_string()).collect(),
        stderr: stderr.iter().map(|s| s.to_string()).collect(),
    }
}

/// `find` output for a directory holding `entries` items, the root included.
pub fn find_listing(root: &str, entries: usize) -> Vec<String> {
    (0..entries)
        .map(|i| {
            if i == 0 {
                root.to_string()
            } else {
                format!("{}/file{}", root, i)
            }
        })
        .collect()
}

pub fn as_strs(lines: &[String]) -> Vec<&str> {
    lines.iter().map(|s| s.as_str()).collect()
}
