//! CLI entry point and command definitions.

use crate::config::PipelineConfig;
use crate::fleet::{build_fleet, FleetLayout};
use crate::job::JobEnv;
use crate::logging::init_logging;
use crate::orchestrator::{FixedInterval, Orchestrator};
use crate::queue::SchedulerQueue;
use crate::remote::{Remote, SshRemote};
use crate::status_log::{log_path, parse_status_log, StatusFollower, StatusLine, STATUS_TAG};
use crate::utils::{base_name, remote_join, JobId, JobIdParser};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::info;

/// Batch Shepherd - launch, monitor, retry and chain jobs on a remote cluster.
#[derive(Parser)]
#[command(name = "shepherd")]
#[command(version = "0.1.0")]
#[command(about = "Launch and monitor computational jobs on a remote batch cluster")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build jobs for every unit in the input folder and run them to completion
    Run {
        /// Pipeline configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,
        /// Tool configuration (JSON) sent to the cluster with every job
        #[arg(short = 's', long)]
        tool_config: Option<PathBuf>,
        /// Remote folder containing one entry per unit
        #[arg(short, long)]
        input: String,
        /// Remote folder where output should be saved
        #[arg(short, long)]
        output: String,
        /// Id of an already running job to watch instead of submitting (single unit only)
        #[arg(short, long)]
        adopt_id: Option<String>,
        /// A unique name identifying this set of jobs
        name: String,
    },
    /// Print the latest progress of controller runs from their logs
    Status {
        /// Directory holding controller logs
        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,
        /// Keep printing new progress records (one run only)
        #[arg(short, long)]
        follow: bool,
        /// Run names (defaults to every log in the directory)
        names: Vec<String>,
    },
    /// Delete the remote jobs last submitted by a controller run
    Cancel {
        /// Pipeline configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,
        /// Directory holding controller logs (defaults to the config's log_dir)
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Run name
        name: String,
    },
}

/// Handle the run command.
pub fn handle_run(
    config_path: &Path,
    tool_config: Option<&Path>,
    input: &str,
    output: &str,
    adopt_id: Option<&str>,
    name: &str,
) -> Result<()> {
    let config = PipelineConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    init_logging(Some(&log_path(&config.log_dir, name)))?;

    info!("{}", "-".repeat(60));
    info!("Launch pipeline {}", name);
    info!("{}", "-".repeat(60));

    let parser = JobIdParser::new(&config.remote.host_suffixes)?;
    let queue = SchedulerQueue::from_config(&config.remote)?;
    let remote = SshRemote::connect(config.remote.clone()).context("Failed to connect")?;

    let (tool_config_value, remote_tool_config) = match tool_config {
        Some(path) => {
            let (value, remote_path) = send_tool_config(&remote, &config, name, path)?;
            (value, Some(remote_path))
        }
        None => (Value::Null, None),
    };

    let env = JobEnv {
        run_name: name.to_string(),
        tool_config: tool_config_value,
        remote_tool_config,
        data_dir: config.remote.data_dir.clone(),
        state_dir: config.state_dir.clone(),
        parser,
    };
    let layout = FleetLayout {
        input_dir: input.to_string(),
        output_dir: output.to_string(),
    };

    let mut fleet = build_fleet(&remote, &config.stages, &layout, &env)
        .context("Failed to create jobs")?;

    if let Some(id) = adopt_id {
        if fleet.len() != 1 {
            bail!("--adopt-id needs exactly one unit, found {}", fleet.len());
        }
        fleet[0].adopt(JobId::new(id));
    }

    let mut orchestrator = Orchestrator::new(
        &remote,
        queue,
        FixedInterval(config.cycle_interval()),
        fleet,
    );
    orchestrator.run().context("Pipeline stopped")?;
    Ok(())
}

/// Parse the tool configuration and send a run-specific copy to the cluster.
fn send_tool_config(
    remote: &dyn Remote,
    config: &PipelineConfig,
    name: &str,
    path: &Path,
) -> Result<(Value, String)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse tool config {}", path.display()))?;

    let file_name = format!("{}_{}", name, base_name(&path.to_string_lossy()));
    let remote_path = remote_join(&config.remote.data_dir, &file_name);
    remote
        .transfer(path, &remote_path)
        .context("Failed to send tool config")?;
    Ok((value, remote_path))
}

/// Handle the status command.
pub fn handle_status(log_dir: &Path, follow: bool, names: Vec<String>) -> Result<()> {
    let names = if names.is_empty() {
        list_runs(log_dir)?
    } else {
        names
    };

    if follow {
        let [name] = names.as_slice() else {
            bail!("--follow needs exactly one run name, found {}", names.len());
        };
        return follow_run(&log_path(log_dir, name));
    }

    if names.is_empty() {
        println!("No controller logs in {}", log_dir.display());
        return Ok(());
    }

    for name in &names {
        let path = log_path(log_dir, name);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        println!("{}", "-".repeat(60));
        println!("{}", name);
        for status in parse_status_log(&text).values() {
            println!("    {}", strip_tag(status));
        }
    }
    println!("{}", "-".repeat(60));
    Ok(())
}

fn strip_tag(status: &StatusLine) -> String {
    status
        .to_string()
        .trim_start_matches(STATUS_TAG)
        .trim_start()
        .to_string()
}

/// Run names with a log in `log_dir`, sorted.
fn list_runs(log_dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", log_dir.display())),
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().to_string()))
        .collect();
    names.sort();
    Ok(names)
}

/// Print progress records as the controller appends them, until interrupted.
fn follow_run(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("No log at {}", path.display());
    }
    let (tx, rx) = mpsc::channel();
    let mut follower = StatusFollower::new(1.0);
    follower.start(path.to_path_buf(), tx);

    println!("Following {} (Ctrl-C to stop)", path.display());
    while let Ok(status) = rx.recv() {
        println!("{}", strip_tag(&status));
    }
    follower.stop();
    Ok(())
}

/// Handle the cancel command.
pub fn handle_cancel(config_path: &Path, log_dir: Option<&Path>, name: &str) -> Result<()> {
    let config = PipelineConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let log_dir = log_dir.unwrap_or(&config.log_dir);
    let path = log_path(log_dir, name);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let ids = latest_ids(&text);
    if ids.is_empty() {
        println!("No submitted jobs recorded for {}", name);
        return Ok(());
    }

    let command = format!("{} {}", config.remote.cancel_command, ids.join(" "));
    println!("Cancel command: {}", command);

    let remote = SshRemote::connect(config.remote.clone()).context("Failed to connect")?;
    let output = remote.execute(&command)?;
    for line in output.stdout.iter().chain(output.stderr.iter()) {
        println!("    {}", line);
    }
    println!("The controller process for {} keeps running until it is stopped.", name);
    Ok(())
}

/// Latest submission id of every unit in a controller log, deduplicated.
fn latest_ids(log_text: &str) -> Vec<String> {
    let mut ids: Vec<String> = parse_status_log(log_text)
        .into_values()
        .filter_map(|status| status.latest)
        .collect();
    ids.sort();
    ids.dedup();
    ids
}
