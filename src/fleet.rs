//! Builds the initial fleet of jobs from a remote input directory.

use crate::config::StageConfig;
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobEnv};
use crate::remote::{listing, Remote};
use crate::utils::{remote_join, shell_quote};
use tracing::{info, warn};

/// Where a run reads units from and writes results to.
#[derive(Debug, Clone)]
pub struct FleetLayout {
    pub input_dir: String,
    pub output_dir: String,
}

/// List the units under `layout.input_dir` and build one pipeline per unit.
///
/// Every pipeline is a chain of jobs, one per stage: the first stage reads
/// the unit directory, each later stage reads the previous stage's output.
/// Stage output is `<output_dir>/<output_prefix><unit>`. The returned order
/// follows the remote listing and carries no meaning. An input folder that
/// cannot be listed is an error.
pub fn build_fleet(
    remote: &dyn Remote,
    stages: &[StageConfig],
    layout: &FleetLayout,
    env: &JobEnv,
) -> Result<Vec<Job>> {
    if stages.is_empty() {
        return Err(PipelineError::InvalidConfig("no stages configured".to_string()));
    }

    let entries = listing(remote, &format!("ls {}", shell_quote(&layout.input_dir)))?;
    let units: Vec<&str> = entries.iter().map(|name| name.trim()).collect();
    if units.is_empty() {
        warn!("No units found in {}", layout.input_dir);
    }

    let mut fleet = Vec::with_capacity(units.len());
    for unit in units {
        let pipeline = build_pipeline(unit, stages, layout, env)?;
        pipeline.validate_chain()?;
        fleet.push(pipeline);
    }

    info!(
        "Created {} jobs: {}",
        fleet.len(),
        fleet
            .iter()
            .map(|j| j.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(fleet)
}

/// Build the chained jobs of one unit, returning the head of the chain.
pub fn build_pipeline(
    unit: &str,
    stages: &[StageConfig],
    layout: &FleetLayout,
    env: &JobEnv,
) -> Result<Job> {
    let mut input = remote_join(&layout.input_dir, unit);
    let mut jobs = Vec::with_capacity(stages.len());
    for stage in stages {
        let output_dir = stage.output_dir.as_deref().unwrap_or(&layout.output_dir);
        let output = remote_join(output_dir, &format!("{}{}", stage.output_prefix, unit));
        jobs.push(Job::new(stage, unit, input, output.clone(), env)?);
        input = output;
    }

    // Link back to front so each job owns its successor.
    let mut head = jobs
        .pop()
        .ok_or_else(|| PipelineError::InvalidConfig("no stages configured".to_string()))?;
    while let Some(mut previous) = jobs.pop() {
        previous.chain_to(head);
        head = previous;
    }
    Ok(head)
}
