//! Jobs: one unit of remote computation and its submission/completion strategy.
//!
//! A job moves NotStarted -> Submitted -> (Finished | NeedsRestart), and from
//! NeedsRestart back to Submitted through `start`. The orchestrator owns the
//! transitions; a job only knows how to submit itself and how to tell, from
//! the remote filesystem, whether its work is done.

use crate::config::{missing, ArtifactConfig, StageConfig, Variant};
use crate::error::{PipelineError, Result};
use crate::remote::{listing, Remote};
use crate::status_log::StatusLine;
use crate::utils::{file_stem, remote_join, shell_quote, JobId, JobIdParser};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Settings shared by every job of one controller run.
#[derive(Debug, Clone)]
pub struct JobEnv {
    /// Unique name of this run, used in manifest file names
    pub run_name: String,
    /// Parsed tool configuration, consulted for `units_key`
    pub tool_config: Value,
    /// Remote path of the transferred tool configuration
    pub remote_tool_config: Option<String>,
    /// Remote directory receiving manifests
    pub data_dir: String,
    /// Local directory where manifests are written first
    pub state_dir: PathBuf,
    pub parser: JobIdParser,
}

/// Exact number of artifacts a finished job leaves behind.
///
/// `units * per_unit + fixed`. For the sliced variant `units` is the number
/// of slices found at check time and `fixed` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactExpectation {
    pub units: usize,
    pub per_unit: usize,
    pub fixed: usize,
}

impl ArtifactExpectation {
    /// Resolve a stage's artifact settings, failing on any missing key.
    pub fn resolve(
        variant: Variant,
        artifacts: &ArtifactConfig,
        tool_config: &Value,
        context: &str,
    ) -> Result<Self> {
        let per_unit = artifacts
            .per_unit
            .ok_or_else(|| missing("artifacts.per_unit", context))?;

        if variant == Variant::Sliced {
            return Ok(Self {
                units: 0,
                per_unit,
                fixed: 0,
            });
        }

        let units = match (artifacts.units, artifacts.units_key.as_deref()) {
            (Some(units), _) => units,
            (None, Some(key)) => tool_config
                .get(key)
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .ok_or_else(|| missing(key, "tool configuration"))?,
            (None, None) => return Err(missing("artifacts.units or artifacts.units_key", context)),
        };
        let fixed = artifacts
            .fixed
            .ok_or_else(|| missing("artifacts.fixed", context))?;

        Ok(Self {
            units,
            per_unit,
            fixed,
        })
    }

    pub fn total(&self) -> usize {
        self.units * self.per_unit + self.fixed
    }
}

/// Artifacts found versus expected at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub found: usize,
    pub expected: usize,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.found == self.expected
    }
}

/// Variant-specific strategy and progress state.
#[derive(Debug, Clone)]
pub enum JobKind {
    /// A single submission processes the whole unit.
    WholeUnit,
    /// One array submission covering the shards still missing their
    /// canonical artifact.
    ShardedUnit {
        canonical: String,
        shard_pattern: Regex,
        /// Shards listed in the most recent manifest
        submitted_shards: Vec<usize>,
    },
    /// The input is a directory of slices; each slice writes its own
    /// `<output>/<slice stem>` folder.
    SlicedUnit {
        /// Slices listed in the most recent manifest
        submitted_slices: Vec<String>,
    },
}

impl JobKind {
    fn new(variant: Variant, artifacts: &ArtifactConfig, context: &str) -> Result<Self> {
        match variant {
            Variant::Whole => Ok(JobKind::WholeUnit),
            Variant::Sharded => {
                let canonical = artifacts
                    .canonical
                    .clone()
                    .ok_or_else(|| missing("artifacts.canonical", context))?;
                let prefix = artifacts.shard_prefix.as_deref().unwrap_or("plane");
                let shard_pattern = Regex::new(&format!(r"/{}(\d+)(?:/|$)", regex::escape(prefix)))
                    .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
                Ok(JobKind::ShardedUnit {
                    canonical,
                    shard_pattern,
                    submitted_shards: Vec::new(),
                })
            }
            Variant::Sliced => Ok(JobKind::SlicedUnit {
                submitted_slices: Vec::new(),
            }),
        }
    }
}

/// One schedulable unit of remote computation.
#[derive(Debug)]
pub struct Job {
    stage: String,
    unit: String,
    input: String,
    output: String,
    submit_template: String,
    kind: JobKind,
    expectation: ArtifactExpectation,
    env: JobEnv,
    /// Submission ids, most recent last
    job_ids: Vec<JobId>,
    next: Option<Box<Job>>,
}

impl Job {
    /// Build a job for `unit` reading `input` and writing `output`.
    ///
    /// Fails when the stage's artifact settings are incomplete; no remote
    /// I/O happens here.
    pub fn new(
        stage: &StageConfig,
        unit: &str,
        input: String,
        output: String,
        env: &JobEnv,
    ) -> Result<Self> {
        let context = format!("stage '{}'", stage.name);
        let expectation =
            ArtifactExpectation::resolve(stage.variant, &stage.artifacts, &env.tool_config, &context)?;
        let kind = JobKind::new(stage.variant, &stage.artifacts, &context)?;

        Ok(Self {
            stage: stage.name.clone(),
            unit: unit.to_string(),
            input,
            output,
            submit_template: stage.submit_command.clone(),
            kind,
            expectation,
            env: env.clone(),
            job_ids: Vec::new(),
            next: None,
        })
    }

    /// The remote workspace this job writes; identifies the job.
    pub fn identity(&self) -> &str {
        &self.output
    }

    #[cfg(test)]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    #[cfg(test)]
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn job_ids(&self) -> &[JobId] {
        &self.job_ids
    }

    /// Id of the most recent submission, `None` if never submitted.
    pub fn latest_id(&self) -> Option<&JobId> {
        self.job_ids.last()
    }

    /// Record a submission made outside this controller (e.g. an array job
    /// that is already running) so the loop waits for it.
    pub fn adopt(&mut self, id: JobId) {
        info!("Adopting job id {} for {}", id, self);
        self.job_ids.push(id);
    }

    /// Set the job to activate once this one finishes. Last write wins.
    pub fn chain_to(&mut self, next: Job) {
        self.next = Some(Box::new(next));
    }

    pub fn next_job(&self) -> Option<&Job> {
        self.next.as_deref()
    }

    pub fn take_next(&mut self) -> Option<Job> {
        self.next.take().map(|b| *b)
    }

    /// Reject chains that revisit a workspace.
    pub fn validate_chain(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut current = Some(self);
        while let Some(job) = current {
            if job.input == job.output || !seen.insert(job.output.as_str()) {
                return Err(PipelineError::ChainCycle {
                    job: self.to_string(),
                    path: job.output.clone(),
                });
            }
            current = job.next_job();
        }
        Ok(())
    }

    /// Count artifacts under the output workspace.
    ///
    /// More artifacts than expected is fatal: either output was duplicated
    /// or the expectation is wrong, and neither can be fixed automatically.
    /// A listing that fails, or a sliced input with no slices, is
    /// `ListingFailed`.
    pub fn progress(&self, remote: &dyn Remote) -> Result<Progress> {
        let entries = self.list_output(remote)?;

        match self.kind {
            JobKind::WholeUnit | JobKind::ShardedUnit { .. } => {
                let progress = Progress {
                    found: entries.len(),
                    expected: self.expectation.total(),
                };
                if progress.found > progress.expected {
                    return Err(self.over_count(&self.output, progress.found, progress.expected));
                }
                Ok(progress)
            }
            JobKind::SlicedUnit { .. } => {
                let slices = self.list_slices(remote)?;
                let per_slice = self.expectation.per_unit;
                let mut found = 0;
                for slice in &slices {
                    let count = self.slice_artifacts(&entries, slice);
                    if count > per_slice {
                        let name = format!("{} slice {}", self.output, file_stem(slice));
                        return Err(self.over_count(&name, count, per_slice));
                    }
                    found += count;
                }
                Ok(Progress {
                    found,
                    expected: slices.len() * per_slice,
                })
            }
        }
    }

    /// True when the output workspace holds exactly the expected artifacts.
    ///
    /// Reads the remote filesystem only; calling it again without remote
    /// changes gives the same answer. An unreadable workspace or input
    /// counts as not finished.
    pub fn is_finished(&self, remote: &dyn Remote) -> Result<bool> {
        let progress = match self.progress(remote) {
            Ok(progress) => progress,
            Err(PipelineError::ListingFailed { command, detail }) => {
                warn!(
                    "Cannot check {}: '{}' failed: {}, treating as not finished",
                    self, command, detail
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        info!(
            "For {} found: {} files, of {} expected",
            self, progress.found, progress.expected
        );
        Ok(progress.is_complete())
    }

    /// Submit (or resubmit) the job.
    ///
    /// Returns the new id, or `None` when submission failed in a way the
    /// next cycle should retry. Only fatal problems are errors.
    pub fn start(&mut self, remote: &dyn Remote) -> Result<Option<JobId>> {
        let manifest = match self.write_manifest(remote) {
            Ok(manifest) => manifest,
            Err(PipelineError::TransferFailed {
                local,
                remote: remote_path,
                detail,
            }) => {
                warn!(
                    "Could not send manifest {} to {} for {}: {}",
                    local, remote_path, self, detail
                );
                return Ok(None);
            }
            Err(PipelineError::ListingFailed { command, detail }) => {
                warn!("Cannot prepare {}: '{}' failed: {}", self, command, detail);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let command = self.render_command(manifest.as_deref());
        info!("ssh exec: {}", command);
        let output = remote.execute(&command)?;

        if output.has_errors() {
            warn!("Error when starting {}: {:?}", self, output.stderr);
            return Ok(None);
        }

        let job_id = match output.stdout.first().and_then(|l| self.env.parser.parse_line(l)) {
            Some(id) => id,
            None => {
                warn!("Failed to get job id for {} from {:?}", self, output.stdout);
                return Ok(None);
            }
        };

        self.job_ids.push(job_id.clone());
        let covered = self.submitted_sub_units();
        if covered.is_empty() {
            info!("Successfully launched: {}", self);
        } else {
            info!("Successfully launched: {} for {} sub-units", self, covered.len());
        }
        Ok(Some(job_id))
    }

    /// Emit a `JOB_STATUS:` record. Never fails; remote errors are logged.
    pub fn log_status(&self, remote: &dyn Remote) {
        match self.progress(remote) {
            Ok(progress) => info!("{}", self.status_line(progress)),
            Err(e) => warn!("No status for {}: {}", self, e),
        }
    }

    pub fn status_line(&self, progress: Progress) -> StatusLine {
        StatusLine {
            unit: self.unit.clone(),
            stage: self.stage.clone(),
            found: progress.found,
            expected: progress.expected,
            latest: self.latest_id().map(|id| id.to_string()),
        }
    }

    /// Fill the submission template.
    ///
    /// Placeholders: `{input}`, `{output}`, `{tool_config}`, `{manifest}`,
    /// `{name}` (run name) and `{unit}`.
    fn render_command(&self, manifest: Option<&str>) -> String {
        let quoted = |v: Option<&str>| v.map(shell_quote).unwrap_or_default();
        self.submit_template
            .replace("{input}", &shell_quote(&self.input))
            .replace("{output}", &shell_quote(&self.output))
            .replace("{tool_config}", &quoted(self.env.remote_tool_config.as_deref()))
            .replace("{manifest}", &quoted(manifest))
            .replace("{name}", &shell_quote(&self.env.run_name))
            .replace("{unit}", &shell_quote(&self.unit))
    }

    /// Write and transfer the list of remaining sub-units, returning its
    /// remote path. Whole-unit jobs have no manifest.
    fn write_manifest(&mut self, remote: &dyn Remote) -> Result<Option<String>> {
        let (file_name, contents) = match self.kind {
            JobKind::WholeUnit => return Ok(None),
            JobKind::ShardedUnit { .. } => {
                let remaining = self.remaining_shards(remote)?;
                info!("Shards left for {}: {:?}", self, remaining);
                if remaining.is_empty() {
                    warn!("Every shard of {} is done but the unit is incomplete", self);
                }
                let contents = serde_json::to_string(&remaining)?;
                if let JobKind::ShardedUnit {
                    ref mut submitted_shards,
                    ..
                } = self.kind
                {
                    *submitted_shards = remaining;
                }
                (
                    format!("shards_left_{}_{}.json", self.env.run_name, self.unit),
                    contents,
                )
            }
            JobKind::SlicedUnit { .. } => {
                let remaining = self.remaining_slices(remote)?;
                info!("{} slices left for {}", remaining.len(), self);
                let contents = remaining.join("\n");
                if let JobKind::SlicedUnit {
                    ref mut submitted_slices,
                } = self.kind
                {
                    *submitted_slices = remaining;
                }
                (
                    format!("incomplete_slices_{}_{}.txt", self.env.run_name, self.unit),
                    contents,
                )
            }
        };

        let local_path = self.env.state_dir.join(&file_name);
        std::fs::write(&local_path, contents)?;
        let remote_path = remote_join(&self.env.data_dir, &file_name);
        remote.transfer(&local_path, &remote_path)?;
        Ok(Some(remote_path))
    }

    /// Shard indices without their canonical artifact.
    ///
    /// Shard folders are matched below the output root only. An unreadable
    /// output means no shard is done yet.
    pub fn remaining_shards(&self, remote: &dyn Remote) -> Result<Vec<usize>> {
        let (canonical, pattern) = match self.kind {
            JobKind::ShardedUnit {
                ref canonical,
                ref shard_pattern,
                ..
            } => (canonical, shard_pattern),
            _ => return Ok(Vec::new()),
        };

        let command = format!(
            "find {} -name {}",
            shell_quote(&self.output),
            shell_quote(canonical)
        );
        let found = missing_means_empty(listing(remote, &command))?;
        let root = self.output.trim_end_matches('/');
        let done: HashSet<usize> = found
            .iter()
            .filter_map(|path| path.strip_prefix(root))
            .filter_map(|rel| pattern.captures(rel))
            .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
            .collect();

        Ok((0..self.expectation.units)
            .filter(|shard| !done.contains(shard))
            .collect())
    }

    /// Absolute paths of slices whose output is not complete yet.
    pub fn remaining_slices(&self, remote: &dyn Remote) -> Result<Vec<String>> {
        let entries = missing_means_empty(self.list_output(remote))?;
        let per_slice = self.expectation.per_unit;
        Ok(self
            .list_slices(remote)?
            .into_iter()
            .filter(|slice| self.slice_artifacts(&entries, slice) != per_slice)
            .collect())
    }

    /// Shards or slices named in the most recent manifest.
    pub fn submitted_sub_units(&self) -> Vec<String> {
        match self.kind {
            JobKind::WholeUnit => Vec::new(),
            JobKind::ShardedUnit {
                ref submitted_shards,
                ..
            } => submitted_shards.iter().map(|s| s.to_string()).collect(),
            JobKind::SlicedUnit {
                ref submitted_slices,
            } => submitted_slices.clone(),
        }
    }

    fn list_output(&self, remote: &dyn Remote) -> Result<Vec<String>> {
        listing(remote, &format!("find {}", shell_quote(&self.output)))
    }

    /// Slices of the input. An empty input is a failed listing, never zero
    /// expected artifacts.
    fn list_slices(&self, remote: &dyn Remote) -> Result<Vec<String>> {
        let command = format!("ls {}", shell_quote(&self.input));
        let slices: Vec<String> = listing(remote, &command)?
            .iter()
            .map(|name| remote_join(&self.input, name.trim()))
            .collect();
        if slices.is_empty() {
            return Err(PipelineError::ListingFailed {
                command,
                detail: "no slices listed".to_string(),
            });
        }
        Ok(slices)
    }

    /// Entries under `<output>/<slice stem>`, that folder included.
    fn slice_artifacts(&self, entries: &[String], slice: &str) -> usize {
        let stem = file_stem(slice);
        let root = self.output.trim_end_matches('/');
        entries
            .iter()
            .filter_map(|entry| entry.strip_prefix(root))
            .filter(|rel| rel.trim_start_matches('/').split('/').next() == Some(stem))
            .count()
    }

    fn over_count(&self, job: &str, found: usize, expected: usize) -> PipelineError {
        PipelineError::ArtifactOverCount {
            job: job.to_string(),
            found,
            expected,
        }
    }
}

/// Treat a failed listing as an empty one.
fn missing_means_empty(listed: Result<Vec<String>>) -> Result<Vec<String>> {
    match listed {
        Err(PipelineError::ListingFailed { command, detail }) => {
            debug!("'{}' failed ({}), assuming nothing there yet", command, detail);
            Ok(Vec::new())
        }
        other => other,
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.job_ids.iter().map(|id| id.as_str()).collect();
        write!(f, "{}({}, ids={:?})", self.stage, self.output, ids)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::{as_strs, find_listing, FakeRemote};
    use serde_json::json;
    use tempfile::TempDir;

    pub(crate) fn env(state_dir: &TempDir) -> JobEnv {
        JobEnv {
            run_name: "run1".to_string(),
            tool_config: json!({ "nplanes": 3 }),
            remote_tool_config: Some("hpc_pipeline/run1_ops.json".to_string()),
            data_dir: "hpc_pipeline".to_string(),
            state_dir: state_dir.path().to_path_buf(),
            parser: JobIdParser::new(&[".awon".to_string()]).unwrap(),
        }
    }

    pub(crate) fn stage(name: &str, variant: Variant) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            variant,
            submit_command: format!("submit_{} {{input}} {{output}} {{tool_config}} {{manifest}}", name),
            output_prefix: format!("{}_", name),
            output_dir: None,
            artifacts: ArtifactConfig {
                units: None,
                units_key: Some("nplanes".to_string()),
                per_unit: Some(2),
                fixed: Some(3),
                canonical: Some("iscell.npy".to_string()),
                shard_prefix: None,
            },
        }
    }

    /// Whole-unit job for fish01, expecting 3 * 2 + 3 = 9 artifacts.
    pub(crate) fn whole_job(name: &str, dir: &TempDir) -> Job {
        Job::new(
            &stage(name, Variant::Whole),
            "fish01",
            "/in/fish01".to_string(),
            format!("/out/{}_fish01", name),
            &env(dir),
        )
        .unwrap()
    }

    #[test]
    fn test_expectation_from_tool_config_key() {
        let dir = TempDir::new().unwrap();
        let job = whole_job("suite2p", &dir);
        assert_eq!(job.expectation.units, 3);
        assert_eq!(job.expectation.total(), 9);
    }

    #[test]
    fn test_missing_units_key_fails_construction() {
        let dir = TempDir::new().unwrap();
        let mut env = env(&dir);
        env.tool_config = json!({ "fs": 2.0 });
        let err = Job::new(
            &stage("suite2p", Variant::Whole),
            "fish01",
            "/in/fish01".to_string(),
            "/out/fish01".to_string(),
            &env,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::MissingConfigKey { ref key, .. } if key == "nplanes"));
    }

    #[test]
    fn test_missing_canonical_fails_sharded_construction() {
        let dir = TempDir::new().unwrap();
        let mut stage = stage("suite2p", Variant::Sharded);
        stage.artifacts.canonical = None;
        let err = Job::new(&stage, "fish01", "/in".into(), "/out".into(), &env(&dir)).unwrap_err();
        assert!(matches!(err, PipelineError::MissingConfigKey { ref key, .. } if key == "artifacts.canonical"));
    }

    #[test]
    fn test_latest_id_tracks_submissions() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let mut job = whole_job("suite2p", &dir);
        assert!(job.latest_id().is_none());

        let submit = "submit_suite2p /in/fish01 /out/suite2p_fish01 hpc_pipeline/run1_ops.json ";
        remote.on_sequence(submit, &[&["101.awon-mgr"], &["102.awon-mgr"], &["103.awon-mgr"]]);
        for expected in ["101", "102", "103"] {
            let id = job.start(&remote).unwrap();
            assert_eq!(id, Some(JobId::new(expected)));
            assert_eq!(job.latest_id(), Some(&JobId::new(expected)));
        }
        assert_eq!(job.job_ids().len(), 3);
    }

    #[test]
    fn test_start_with_stderr_leaves_ids_unchanged() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let mut job = whole_job("suite2p", &dir);
        let submit = "submit_suite2p /in/fish01 /out/suite2p_fish01 hpc_pipeline/run1_ops.json ";

        remote.on_error(submit, &["qsub: would exceed queue limit"]);
        assert_eq!(job.start(&remote).unwrap(), None);
        assert!(job.latest_id().is_none());

        remote.on(submit, &["garbage"]);
        assert_eq!(job.start(&remote).unwrap(), None);
        assert!(job.job_ids().is_empty());

        remote.on(submit, &[]);
        assert_eq!(job.start(&remote).unwrap(), None);
        assert!(job.job_ids().is_empty());
    }

    #[test]
    fn test_completion_count_boundaries() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let job = whole_job("suite2p", &dir);
        let find = "find /out/suite2p_fish01";

        remote.on(find, &as_strs(&find_listing("/out/suite2p_fish01", 8)));
        assert!(!job.is_finished(&remote).unwrap());

        remote.on(find, &as_strs(&find_listing("/out/suite2p_fish01", 9)));
        assert!(job.is_finished(&remote).unwrap());

        remote.on(find, &as_strs(&find_listing("/out/suite2p_fish01", 10)));
        let err = job.is_finished(&remote).unwrap_err();
        match err {
            PipelineError::ArtifactOverCount { job, found, expected } => {
                assert!(job.contains("suite2p_fish01"));
                assert_eq!(found, 10);
                assert_eq!(expected, 9);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_is_finished_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let job = whole_job("suite2p", &dir);
        remote.on("find /out/suite2p_fish01", &as_strs(&find_listing("/out/suite2p_fish01", 5)));

        let first = job.is_finished(&remote).unwrap();
        let second = job.is_finished(&remote).unwrap();
        assert_eq!(first, second);
        assert!(job.job_ids().is_empty());
        assert!(remote.transfers.borrow().is_empty());
        assert_eq!(remote.count_prefix("submit_"), 0);
    }

    #[test]
    fn test_sharded_start_submits_remaining_shards() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let mut job = Job::new(
            &stage("suite2p", Variant::Sharded),
            "fish01",
            "/in/fish01".to_string(),
            "/out/fish01".to_string(),
            &env(&dir),
        )
        .unwrap();

        remote.on(
            "find /out/fish01 -name iscell.npy",
            &["/out/fish01/plane1/iscell.npy", "/out/fish01/plane12/other/iscell.npy"],
        );
        let submit = "submit_suite2p /in/fish01 /out/fish01 hpc_pipeline/run1_ops.json hpc_pipeline/shards_left_run1_fish01.json";
        remote.on(submit, &["777[].awon-mgr"]);

        assert_eq!(job.start(&remote).unwrap(), Some(JobId::new("777")));
        let transfers = remote.transfers.borrow();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].0, "hpc_pipeline/shards_left_run1_fish01.json");
        assert_eq!(transfers[0].1, "[0,2]");
        assert_eq!(job.submitted_sub_units(), vec!["0", "2"]);
    }

    #[test]
    fn test_failed_manifest_transfer_is_retried_later() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        remote.fail_transfers.set(true);
        let mut job = Job::new(
            &stage("suite2p", Variant::Sharded),
            "fish01",
            "/in/fish01".to_string(),
            "/out/fish01".to_string(),
            &env(&dir),
        )
        .unwrap();

        assert_eq!(job.start(&remote).unwrap(), None);
        assert!(job.job_ids().is_empty());
        assert_eq!(remote.count_prefix("submit_"), 0);
    }

    fn sliced_job(dir: &TempDir) -> Job {
        Job::new(
            &stage("slices", Variant::Sliced),
            "fish02",
            "/in/fish02".to_string(),
            "/out/slices_fish02".to_string(),
            &env(dir),
        )
        .unwrap()
    }

    #[test]
    fn test_sliced_progress_per_slice() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let job = sliced_job(&dir);
        remote.on("ls /in/fish02", &["slice1.tif  ", "slice10.tif", ""]);
        remote.on(
            "find /out/slices_fish02",
            &[
                "/out/slices_fish02",
                "/out/slices_fish02/slice1",
                "/out/slices_fish02/slice1/F.npy",
                "/out/slices_fish02/slice10",
            ],
        );

        let progress = job.progress(&remote).unwrap();
        assert_eq!(progress, Progress { found: 3, expected: 4 });
        assert!(!job.is_finished(&remote).unwrap());
        assert_eq!(
            job.remaining_slices(&remote).unwrap(),
            vec!["/in/fish02/slice10.tif".to_string()]
        );

        remote.on(
            "find /out/slices_fish02",
            &[
                "/out/slices_fish02",
                "/out/slices_fish02/slice1",
                "/out/slices_fish02/slice1/F.npy",
                "/out/slices_fish02/slice1/ops.npy",
            ],
        );
        let err = job.progress(&remote).unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactOverCount { found: 3, expected: 2, .. }));
    }

    #[test]
    fn test_sliced_start_writes_incomplete_slices() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let mut job = sliced_job(&dir);
        remote.on("ls /in/fish02", &["slice1.tif", "slice2.tif"]);
        remote.on(
            "find /out/slices_fish02",
            &["/out/slices_fish02/slice2", "/out/slices_fish02/slice2/F.npy"],
        );
        remote.on(
            "submit_slices /in/fish02 /out/slices_fish02 hpc_pipeline/run1_ops.json hpc_pipeline/incomplete_slices_run1_fish02.txt",
            &["55.awon-mgr"],
        );

        assert_eq!(job.start(&remote).unwrap(), Some(JobId::new("55")));
        assert_eq!(remote.transfers.borrow()[0].1, "/in/fish02/slice1.tif");
    }

    #[test]
    fn test_sliced_job_with_unreadable_input_is_not_finished() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let mut job = sliced_job(&dir);
        remote.on_error("ls /in/fish02", &["ls: cannot access '/in/fish02': Input/output error"]);
        remote.on_error("find /out/slices_fish02", &["find: '/out/slices_fish02': No such file or directory"]);

        assert!(matches!(
            job.progress(&remote),
            Err(PipelineError::ListingFailed { .. })
        ));
        assert!(!job.is_finished(&remote).unwrap());

        // Submission waits for a readable input.
        assert_eq!(job.start(&remote).unwrap(), None);
        assert_eq!(remote.count_prefix("submit_"), 0);
        assert!(remote.transfers.borrow().is_empty());
    }

    #[test]
    fn test_sliced_job_with_empty_input_is_not_finished() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let job = sliced_job(&dir);
        remote.on("ls /in/fish02", &[]);
        remote.on("find /out/slices_fish02", &[]);

        assert!(!job.is_finished(&remote).unwrap());
    }

    #[test]
    fn test_sliced_start_before_any_output() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let mut job = sliced_job(&dir);
        remote.on("ls /in/fish02", &["slice1.tif", "slice2.tif"]);
        remote.on_error("find /out/slices_fish02", &["find: '/out/slices_fish02': No such file or directory"]);
        remote.on(
            "submit_slices /in/fish02 /out/slices_fish02 hpc_pipeline/run1_ops.json hpc_pipeline/incomplete_slices_run1_fish02.txt",
            &["56.awon-mgr"],
        );

        assert!(!job.is_finished(&remote).unwrap());
        assert_eq!(job.start(&remote).unwrap(), Some(JobId::new("56")));
        assert_eq!(
            remote.transfers.borrow()[0].1,
            "/in/fish02/slice1.tif\n/in/fish02/slice2.tif"
        );
    }

    #[test]
    fn test_whole_job_with_missing_output_is_not_finished() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let job = whole_job("suite2p", &dir);
        remote.on_error(
            "find /out/suite2p_fish01",
            &["find: '/out/suite2p_fish01': No such file or directory"],
        );
        assert!(!job.is_finished(&remote).unwrap());
    }

    #[test]
    fn test_shard_folders_matched_below_output_root() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let job = Job::new(
            &stage("suite2p", Variant::Sharded),
            "fish01",
            "/in/fish01".to_string(),
            "/data/plane1/out".to_string(),
            &env(&dir),
        )
        .unwrap();

        remote.on(
            "find /data/plane1/out -name iscell.npy",
            &["/data/plane1/out/plane0/iscell.npy"],
        );
        assert_eq!(job.remaining_shards(&remote).unwrap(), vec![1, 2]);

        remote.on_error(
            "find /data/plane1/out -name iscell.npy",
            &["find: '/data/plane1/out': No such file or directory"],
        );
        assert_eq!(job.remaining_shards(&remote).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_chain_validation() {
        let dir = TempDir::new().unwrap();
        let mut first = whole_job("suite2p", &dir);
        first.chain_to(whole_job("warp", &dir));
        assert!(first.validate_chain().is_ok());
        assert_eq!(first.next_job().unwrap().stage(), "warp");

        // Last write wins.
        first.chain_to(whole_job("suite2p", &dir));
        let err = first.validate_chain().unwrap_err();
        assert!(matches!(err, PipelineError::ChainCycle { .. }));

        let taken = first.take_next().unwrap();
        assert_eq!(taken.stage(), "suite2p");
        assert!(first.next_job().is_none());
    }

    #[test]
    fn test_status_line_before_submission() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::new();
        let job = whole_job("suite2p", &dir);
        let line = job.status_line(Progress { found: 0, expected: 9 });
        assert_eq!(line.unit, "fish01");
        assert_eq!(line.latest, None);
        // Never panics or errors, even with nothing submitted.
        job.log_status(&remote);
    }
}
