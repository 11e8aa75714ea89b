use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use optlab_core::{job_file_for, load_job, save_job, Job, JobId, JobStatus, ParamMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;

use crate::grid::{FileGridStore, GridStore};
use crate::objective::{CommandObjective, Objective};

const MAX_REPORT_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Complete { value: f64, duration: f64 },
    Broken { duration: f64 },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Complete { .. } => JobStatus::Complete,
            JobOutcome::Broken { .. } => JobStatus::Broken,
        }
    }
}

pub fn run_job_file(job_path: &Path) -> Result<JobOutcome> {
    let job = load_job(job_path)?;
    let store = FileGridStore::open(&job.expt_dir)?;
    let objective = CommandObjective::for_job(&job);
    run_job(job, &store, &objective)
}

/// Executes one job and records the outcome both in its Job Record and in the
/// grid store.
///
/// Failures of the objective are absorbed into a `Broken` outcome; only a
/// failure to persist the final record is returned as an error.
pub fn run_job(mut job: Job, store: &dyn GridStore, objective: &dyn Objective) -> Result<JobOutcome> {
    let job_id = job.id;
    let job_path = job_file_for(&job);
    tracing::info!(job_id, name = %job.name, "running job in worker mode");

    if let Err(e) = store.job_running(job_id) {
        tracing::warn!(job_id, phase = "mark_running", error = %e, "could not mark job running");
    }

    job.start_t = Some(Utc::now());
    job.status = JobStatus::Running;
    if let Err(e) = save_job(&job) {
        tracing::warn!(job_id, phase = "start", error = %e, "could not persist running state");
    }

    let started = Instant::now();
    let mut evaluated = false;
    match evaluate_isolated(objective, job_id, job.param_map()) {
        Ok(value) => {
            tracing::info!(job_id, value, "got result");
            job.value = Some(value);
            match save_job(&job) {
                Ok(_) => evaluated = true,
                Err(e) => {
                    tracing::error!(job_id, phase = "store_result", error = %e, "could not persist result")
                }
            }
        }
        Err(e) => {
            tracing::error!(
                job_id,
                phase = "execute",
                duration_secs = started.elapsed().as_secs_f64(),
                report = %bounded_report(&e),
                "problem running the job"
            );
        }
    }
    let duration = started.elapsed().as_secs_f64();

    // The record on disk decides the outcome, not the in-memory copy.
    let mut job = match load_job(&job_path) {
        Ok(reloaded) => {
            tracing::debug!(job_id, "job record reloaded");
            reloaded
        }
        Err(e) => {
            tracing::error!(job_id, phase = "reload", error = %e, "could not reload job record");
            evaluated = false;
            job
        }
    };
    if evaluated && job.value.is_none() {
        tracing::error!(job_id, "could not find value in job record");
    }

    let mut outcome = match job.value {
        Some(value) if evaluated => {
            tracing::info!(job_id, duration_secs = duration, value, "completed successfully");
            JobOutcome::Complete { value, duration }
        }
        _ => {
            tracing::warn!(job_id, duration_secs = duration, "job failed");
            JobOutcome::Broken { duration }
        }
    };
    let reported = match outcome {
        JobOutcome::Complete { value, .. } => store.job_complete(job_id, value, duration),
        JobOutcome::Broken { .. } => store.job_broken(job_id),
    };
    if let Err(e) = reported {
        tracing::error!(job_id, phase = "report", error = %e, "grid refused the outcome");
        // Record follows a grid that already holds a terminal state.
        if let Some(settled) = grid_outcome(store, job_id, duration) {
            if settled != outcome {
                tracing::warn!(job_id, status = settled.status().as_str(), "record follows the grid");
                outcome = settled;
            }
        }
    }

    match outcome {
        JobOutcome::Complete { value, .. } => job.value = Some(value),
        JobOutcome::Broken { .. } => job.value = None,
    }

    job.status = outcome.status();
    job.end_t = Some(Utc::now());
    job.duration = Some(duration);
    save_job(&job).with_context(|| format!("failed to persist final state of job {}", job_id))?;
    Ok(outcome)
}

fn grid_outcome(store: &dyn GridStore, job_id: JobId, duration: f64) -> Option<JobOutcome> {
    let state = match store.load_state() {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(job_id, phase = "report", error = %e, "could not read grid state");
            return None;
        }
    };
    if state.broken.contains(&job_id) {
        return Some(JobOutcome::Broken { duration });
    }
    if state.complete.contains(&job_id) {
        let value = state.snapshot.values.get(job_id as usize).copied()?;
        return Some(JobOutcome::Complete { value, duration });
    }
    None
}

fn evaluate_isolated(objective: &dyn Objective, job_id: JobId, params: ParamMap) -> Result<f64> {
    match panic::catch_unwind(AssertUnwindSafe(|| objective.evaluate(job_id, &params))) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(anyhow!("objective panicked: {}", msg))
        }
    }
}

fn bounded_report(err: &anyhow::Error) -> String {
    let mut report = format!("{:#}", err);
    if report.len() > MAX_REPORT_CHARS {
        let mut cut = MAX_REPORT_CHARS;
        while !report.is_char_boundary(cut) {
            cut -= 1;
        }
        report.truncate(cut);
        report.push_str("...");
    }
    report
}
