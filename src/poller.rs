//! The monitoring loop: poll every active job, resubmit what failed, collect
//! what finished, until nothing is left.
use color_eyre::eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rustc_hash::FxHashMap;
use std::time::Duration;

use super::collector::OutputCollector;
use super::grid::{GridClient, StatusReport};
use super::job::{JobDescriptor, Resources};

/// Subtask exceeded its wall-clock limit
pub const EXIT_WALLTIME: i64 = 50664;
/// Subtask exceeded its memory limit
pub const EXIT_MEMORY: i64 = 50660;
pub const RUNTIME_STEP_MIN: u32 = 260;
pub const MEMORY_STEP_MB: u32 = 500;

/// Limits for a resubmission. Always computed from the job's base limits, so
/// escalating twice from the same base gives the same answer.
pub fn escalate(base: Resources, exit_codes: &[i64]) -> Resources {
    Resources {
        memory_mb: if exit_codes.contains(&EXIT_MEMORY) {
            base.memory_mb + MEMORY_STEP_MB
        } else {
            base.memory_mb
        },
        runtime_min: if exit_codes.contains(&EXIT_WALLTIME) {
            base.runtime_min + RUNTIME_STEP_MIN
        } else {
            base.runtime_min
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Unsubmitted,
    Submitted,
    Idle,
    Running,
    FailedPartial,
    Finished,
    Abandoned,
}

/// What the monitor has to do after a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Wait,
    Recreate,
    Resubmit(Resources),
    Collect,
}

/// Classify a status report of a submitted job.
pub fn classify(report: &StatusReport, base: Resources) -> (JobState, Action) {
    if report.submit_failed() {
        return (JobState::Unsubmitted, Action::Recreate);
    }
    if report.count("failed") != 0 {
        if report.resubmittable() {
            let limits = escalate(base, &report.exit_codes());
            return (JobState::FailedPartial, Action::Resubmit(limits));
        }
        return (JobState::FailedPartial, Action::Wait);
    }
    if report.all_finished() {
        return (JobState::Finished, Action::Collect);
    }
    if report.count("running") != 0 {
        (JobState::Running, Action::Wait)
    } else if report.jobs.is_empty() {
        (JobState::Submitted, Action::Wait)
    } else {
        (JobState::Idle, Action::Wait)
    }
}

#[derive(Debug)]
struct TrackedJob {
    descriptor: JobDescriptor,
    state: JobState,
    resubmits: u32,
    /// The monitor removed the grid dir and has not managed to submit again
    recreating: bool,
}

/// Outcome of a full monitoring run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorSummary {
    pub finished: Vec<String>,
    pub abandoned: Vec<String>,
    pub rounds: u64,
}

/// Owns the set of active jobs. Jobs leave the set once they are finished
/// (manifest written) or abandoned after too many resubmissions.
#[derive(Debug)]
pub struct Monitor<'a, G: GridClient> {
    client: &'a G,
    collector: OutputCollector<'a, G>,
    active: FxHashMap<String, TrackedJob>,
    interval: Duration,
    max_resubmits: Option<u32>,
}

impl<'a, G: GridClient> Monitor<'a, G> {
    pub fn new(
        client: &'a G,
        collector: OutputCollector<'a, G>,
        jobs: Vec<JobDescriptor>,
        interval: Duration,
        max_resubmits: Option<u32>,
    ) -> Self {
        let active = jobs
            .into_iter()
            .map(|descriptor| {
                (
                    descriptor.name().to_string(),
                    TrackedJob {
                        descriptor,
                        state: JobState::Unsubmitted,
                        resubmits: 0,
                        recreating: false,
                    },
                )
            })
            .collect();
        Self {
            client,
            collector,
            active,
            interval,
            max_resubmits,
        }
    }

    pub fn active(&self) -> usize {
        self.active.len()
    }

    #[cfg(test)]
    pub fn state(&self, name: &str) -> Option<JobState> {
        self.active.get(name).map(|job| job.state)
    }

    /// Poll until the active set is empty.
    pub fn run(&mut self) -> Result<MonitorSummary> {
        let progress = ProgressBar::new(self.active.len() as u64)
            .with_style(ProgressStyle::with_template(
                "{msg}: {bar:40.cyan/blue} [{pos}/{len} jobs] (Elapsed: {elapsed})",
            )?)
            .with_message("Monitoring");
        let mut summary = MonitorSummary::default();
        while !self.active.is_empty() {
            let done = self.poll_once()?;
            summary.rounds += 1;
            for (name, state) in done {
                progress.inc(1);
                match state {
                    JobState::Abandoned => summary.abandoned.push(name),
                    _ => summary.finished.push(name),
                }
            }
            if !self.active.is_empty() {
                std::thread::sleep(self.interval);
            }
        }
        progress.finish();
        Ok(summary)
    }

    /// Poll every active job once. Returns the jobs that left the active set.
    pub fn poll_once(&mut self) -> Result<Vec<(String, JobState)>> {
        let mut names: Vec<String> = self.active.keys().cloned().collect();
        names.sort();

        let mut done = Vec::new();
        for name in names {
            let Some(job) = self.active.get_mut(&name) else {
                continue;
            };
            let state = poll_job(self.client, &self.collector, job, self.max_resubmits)?;
            job.state = state;
            if matches!(state, JobState::Finished | JobState::Abandoned) {
                self.active.remove(&name);
                done.push((name, state));
            }
        }
        Ok(done)
    }
}

fn poll_job<G: GridClient>(
    client: &G,
    collector: &OutputCollector<'_, G>,
    job: &mut TrackedJob,
    max_resubmits: Option<u32>,
) -> Result<JobState> {
    let over_ceiling = max_resubmits.is_some_and(|max| job.resubmits >= max);
    let grid_dir = job.descriptor.grid_dir();
    if !grid_dir.exists() {
        if !job.recreating {
            return Ok(JobState::Unsubmitted);
        }
        if over_ceiling {
            return Ok(give_up(job));
        }
        info!("Retrying the submission of {}", job.descriptor.name());
        return Ok(submit_again(client, job));
    }

    let report = match client.status(grid_dir) {
        Ok(report) => report,
        Err(e) => {
            warn!("Status of {} unavailable: {e}", job.descriptor.name());
            return Ok(job.state);
        }
    };

    let (state, action) = classify(&report, job.descriptor.resources());
    match action {
        Action::Wait => Ok(state),
        Action::Recreate | Action::Resubmit(_) if over_ceiling => Ok(give_up(job)),
        Action::Recreate => {
            info!("Submission of {} failed, recreating", job.descriptor.name());
            std::fs::remove_dir_all(grid_dir)?;
            Ok(submit_again(client, job))
        }
        Action::Resubmit(limits) => {
            info!(
                "Resubmitting failed subtasks of {} ({} MB, {} min)",
                job.descriptor.name(),
                limits.memory_mb,
                limits.runtime_min
            );
            job.resubmits += 1;
            if let Err(e) = client.resubmit(grid_dir, limits) {
                warn!("Resubmission of {} failed: {e}", job.descriptor.name());
            }
            Ok(state)
        }
        Action::Collect => match collector.collect(&job.descriptor, &report) {
            Ok(manifests) => {
                info!(
                    "{} finished, wrote {} manifest(s)",
                    job.descriptor.name(),
                    manifests.len()
                );
                Ok(state)
            }
            Err(e) => {
                error!(
                    "Could not write the manifest of {}, giving up: {e:?}",
                    job.descriptor.name()
                );
                Ok(JobState::Abandoned)
            }
        },
    }
}

/// Submit a job whose grid dir the monitor removed. Counts as a resubmission.
fn submit_again<G: GridClient>(client: &G, job: &mut TrackedJob) -> JobState {
    job.resubmits += 1;
    match client.submit(&job.descriptor) {
        Ok(()) => {
            job.recreating = false;
            JobState::Submitted
        }
        Err(e) => {
            warn!("Resubmission of {} failed: {e}", job.descriptor.name());
            job.recreating = true;
            JobState::Unsubmitted
        }
    }
}

fn give_up(job: &TrackedJob) -> JobState {
    error!(
        "Giving up on {} after {} resubmissions",
        job.descriptor.name(),
        job.resubmits
    );
    JobState::Abandoned
}
