//! Reads the scheduler queue into a snapshot of active job ids.

use crate::config::RemoteConfig;
use crate::error::Result;
use crate::remote::Remote;
use crate::utils::{JobId, JobIdParser};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Job ids the scheduler reported as queued or running at one point in time.
pub type SchedulerSnapshot = HashSet<JobId>;

/// Runs the scheduler status command and parses its output.
#[derive(Debug, Clone)]
pub struct SchedulerQueue {
    status_command: String,
    parser: JobIdParser,
}

impl SchedulerQueue {
    pub fn new(status_command: impl Into<String>, parser: JobIdParser) -> Self {
        Self {
            status_command: status_command.into(),
            parser,
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        Ok(Self::new(
            config.status_command.clone(),
            JobIdParser::new(&config.host_suffixes)?,
        ))
    }

    /// Fetch a fresh snapshot. Nothing is cached between calls.
    ///
    /// Only lines carrying a known host suffix are read, so a format change
    /// on the scheduler side shows up as an empty snapshot.
    pub fn current_jobs(&self, remote: &dyn Remote) -> Result<SchedulerSnapshot> {
        let output = remote.execute(&self.status_command)?;
        if output.has_errors() {
            warn!("'{}' reported errors: {:?}", self.status_command, output.stderr);
        }

        let snapshot = self.parse(&output.stdout);
        if snapshot.is_empty() {
            warn!(
                "'{}' listed no recognised job ids ({} lines of output)",
                self.status_command,
                output.stdout.len()
            );
        } else {
            debug!("Active jobs: {:?}", snapshot);
        }
        Ok(snapshot)
    }

    pub fn parse(&self, lines: &[String]) -> SchedulerSnapshot {
        lines
            .iter()
            .filter_map(|line| self.parser.parse_line(line))
            .collect()
    }
}
