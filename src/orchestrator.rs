//! Orchestrator loop: reconcile the fleet against the scheduler until every
//! job is finished.

use crate::error::{PipelineError, Result};
use crate::job::Job;
use crate::queue::SchedulerQueue;
use crate::remote::Remote;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// Decides how long to wait between cycles.
///
/// Failed submissions are retried every cycle without limit; the policy only
/// controls the pause, so tests can run cycles back to back.
pub trait RetryPolicy {
    fn wait(&self, cycle: u64);
}

/// Sleep a fixed interval between cycles.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval(pub Duration);

impl RetryPolicy for FixedInterval {
    fn wait(&self, cycle: u64) {
        info!("Cycle {} done, next check in {:?}", cycle, self.0);
        thread::sleep(self.0);
    }
}

/// What one cycle did, by job identity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub running: Vec<String>,
    pub restarted: Vec<String>,
    pub finished: Vec<String>,
    pub activated: Vec<String>,
}

/// Owns the fleet and drives it to completion.
pub struct Orchestrator<'r, P: RetryPolicy> {
    remote: &'r dyn Remote,
    queue: SchedulerQueue,
    policy: P,
    fleet: Vec<Job>,
    cycle: u64,
}

impl<'r, P: RetryPolicy> Orchestrator<'r, P> {
    pub fn new(remote: &'r dyn Remote, queue: SchedulerQueue, policy: P, fleet: Vec<Job>) -> Self {
        Self {
            remote,
            queue,
            policy,
            fleet,
            cycle: 0,
        }
    }

    /// Jobs not yet finished.
    #[cfg(test)]
    pub fn fleet(&self) -> &[Job] {
        &self.fleet
    }

    /// Run cycles until the fleet is empty.
    ///
    /// There is no cancellation; a fatal error ends the run and leaves any
    /// remote jobs in place.
    pub fn run(&mut self) -> Result<()> {
        info!("Managing {} incomplete jobs", self.fleet.len());
        while !self.fleet.is_empty() {
            if let Err(e) = self.run_cycle() {
                error!("Fatal: {}", e);
                return Err(e);
            }
            if !self.fleet.is_empty() {
                self.policy.wait(self.cycle);
            }
        }
        info!("All jobs finished after {} cycles", self.cycle);
        Ok(())
    }

    /// One reconciliation pass over the fleet.
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        self.cycle += 1;
        let snapshot = self.queue.current_jobs(self.remote)?;
        info!("Check on job states, cycle {}", self.cycle);

        let mut report = CycleReport::default();
        let mut finished = Vec::new();

        for (idx, job) in self.fleet.iter_mut().enumerate() {
            // Still queued or running, skip for now
            if job.latest_id().is_some_and(|id| snapshot.contains(id)) {
                info!("Still running, skip {}", job);
                report.running.push(job.identity().to_string());
                continue;
            }

            if job.is_finished(self.remote)? {
                info!("Job finished: {}", job);
                report.finished.push(job.identity().to_string());
                finished.push(idx);
                continue;
            }

            // Not running and not finished, so (re)start
            job.start(self.remote)?;
            report.restarted.push(job.identity().to_string());
        }

        // Remove back to front so earlier indices stay valid
        let mut done: Vec<Job> = finished
            .into_iter()
            .rev()
            .map(|idx| self.fleet.remove(idx))
            .collect();
        done.reverse();

        for mut job in done {
            if let Some(next) = job.take_next() {
                let next = activate_chained(&job, next, self.remote)?;
                report.activated.push(next.identity().to_string());
                self.fleet.push(next);
            }
        }

        for job in &self.fleet {
            job.log_status(self.remote);
        }

        Ok(report)
    }
}

/// Start the successor of a finished job.
///
/// A successor whose output is already complete means stale or reused data
/// and is fatal.
pub fn activate_chained(predecessor: &Job, mut next: Job, remote: &dyn Remote) -> Result<Job> {
    if next.is_finished(remote)? {
        return Err(PipelineError::ChainAlreadyFinished {
            job: next.to_string(),
            predecessor_ids: predecessor
                .job_ids()
                .iter()
                .map(|id| id.to_string())
                .collect(),
        });
    }

    info!("Starting chained job {} after {}", next, predecessor);
    next.start(remote)?;
    Ok(next)
}
