//! Pipeline configuration loaded from a TOML file.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Remote host and scheduler settings
    pub remote: RemoteConfig,

    /// Seconds to wait between two orchestrator cycles
    pub cycle_interval_secs: u64,

    /// Directory holding one `<name>.log` per controller run
    pub log_dir: PathBuf,

    /// Local directory where manifests are written before transfer
    pub state_dir: PathBuf,

    /// Processing stages; every unit runs through them in order
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            cycle_interval_secs: 6 * 60 * 60,
            log_dir: PathBuf::from("logs"),
            state_dir: PathBuf::from("."),
            stages: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a pipeline file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content).map_err(|e| {
            PipelineError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.remote.host.is_empty() {
            return Err(missing("host", "[remote]"));
        }
        if self.remote.user.is_empty() {
            return Err(missing("user", "[remote]"));
        }
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one [[stages]] entry is required".to_string(),
            ));
        }
        for stage in &self.stages {
            if stage.submit_command.trim().is_empty() {
                return Err(missing("submit_command", &format!("stage '{}'", stage.name)));
            }
        }
        Ok(())
    }
}

/// Connection and scheduler settings for the remote cluster.
///
/// Passed explicitly to the remote executor; nothing reads credentials from
/// the process environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    /// Private key passed to ssh with `-i`
    pub identity_file: Option<PathBuf>,
    /// Remote directory that receives manifests and the tool configuration
    pub data_dir: String,
    /// Command listing queued and running jobs
    pub status_command: String,
    /// Command deleting jobs, ids are appended
    pub cancel_command: String,
    /// Suffixes that follow a job id in scheduler output
    pub host_suffixes: Vec<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            port: 22,
            identity_file: None,
            data_dir: "hpc_pipeline".to_string(),
            status_command: "qstat".to_string(),
            cancel_command: "qdel".to_string(),
            host_suffixes: vec![".awon".to_string()],
        }
    }
}

impl RemoteConfig {
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Job variant tag selecting the submission and completion strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Variant {
    /// One submission processes the whole unit
    Whole,
    /// One array submission with one task per remaining shard
    Sharded,
    /// Unit input is a directory of slices, each tracked separately
    Sliced,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Whole => "whole",
            Variant::Sharded => "sharded",
            Variant::Sliced => "sliced",
        }
    }
}

impl FromStr for Variant {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "whole" => Ok(Variant::Whole),
            "sharded" => Ok(Variant::Sharded),
            "sliced" => Ok(Variant::Sliced),
            other => Err(PipelineError::UnknownVariant(other.to_string())),
        }
    }
}

impl TryFrom<String> for Variant {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Variant> for String {
    fn from(value: Variant) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One processing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub variant: Variant,
    /// Submission command template, see `job::render_command`
    pub submit_command: String,
    /// Prefix joined to the unit name to form the output workspace
    #[serde(default)]
    pub output_prefix: String,
    /// Overrides the run's output directory for this stage
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
}

/// Raw artifact-count settings of a stage.
///
/// Resolved into an `ArtifactExpectation` when a job is built, so a missing
/// key fails construction instead of a later status check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Literal number of sub-units
    pub units: Option<usize>,
    /// Key in the tool configuration JSON holding the number of sub-units
    pub units_key: Option<String>,
    /// Artifacts produced per sub-unit (per slice for the sliced variant)
    pub per_unit: Option<usize>,
    /// Artifacts produced once per unit, the output directory itself included
    pub fixed: Option<usize>,
    /// File whose presence marks a finished shard
    pub canonical: Option<String>,
    /// Directory prefix of shard folders, followed by the shard index
    pub shard_prefix: Option<String>,
}

pub(crate) fn missing(key: &str, context: &str) -> PipelineError {
    PipelineError::MissingConfigKey {
        key: key.to_string(),
        context: context.to_string(),
    }
}
