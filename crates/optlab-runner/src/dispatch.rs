use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use optlab_core::{
    append_line, atomic_write_bytes, ensure_dir, remove_job_file, save_job, Experiment, Job, JobId,
};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::chooser::{Choice, Chooser};
use crate::driver::Driver;
use crate::grid::{GridState, GridStore};

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub max_concurrent: usize,
    pub max_finished_jobs: usize,
    pub polling_time: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_finished_jobs: 10_000,
            polling_time: Duration::from_secs(3),
        }
    }
}

pub fn trace_path(expt_dir: &Path) -> PathBuf {
    expt_dir.join("trace.csv")
}

pub fn best_job_path(expt_dir: &Path) -> PathBuf {
    expt_dir.join("best_job_and_result.txt")
}

pub fn check_experiment_dirs(expt_dir: &Path) -> Result<()> {
    if !expt_dir.is_dir() {
        return Err(anyhow!(
            "cannot find experiment directory {}",
            expt_dir.display()
        ));
    }
    for sub in ["output", "jobs"] {
        let dir = expt_dir.join(sub);
        ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

pub fn run_dispatch_loop(
    expt: &Experiment,
    expt_dir: &Path,
    chooser: &mut dyn Chooser,
    driver: &dyn Driver,
    store: &dyn GridStore,
    options: &DispatchOptions,
) -> Result<usize> {
    check_experiment_dirs(expt_dir)?;
    tracing::info!(
        experiment = %expt.name,
        chooser = chooser.name(),
        driver = driver.name(),
        max_concurrent = options.max_concurrent,
        max_finished_jobs = options.max_finished_jobs,
        "starting dispatch loop"
    );
    let mut iterations = 0;
    loop {
        iterations += 1;
        if !attempt_dispatch(expt, expt_dir, chooser, driver, store, options)? {
            break;
        }
        thread::sleep(options.polling_time);
    }
    tracing::info!(iterations, "dispatch loop finished");
    Ok(iterations)
}

/// One scheduling step: reconcile lost jobs, record progress, then submit at
/// most one job. Returns `false` once the loop should stop.
pub fn attempt_dispatch(
    expt: &Experiment,
    expt_dir: &Path,
    chooser: &mut dyn Chooser,
    driver: &dyn Driver,
    store: &dyn GridStore,
    options: &DispatchOptions,
) -> Result<bool> {
    let mut state = store.load_state()?;
    if reconcile(&state, driver, store)? > 0 {
        state = store.load_state()?;
    }

    write_trace(expt_dir, &state)?;
    write_best_job(expt_dir, &state)?;

    let (n_candidates, n_pending, n_complete) = (
        state.candidates.len(),
        state.pending.len(),
        state.complete.len(),
    );
    if n_complete >= options.max_finished_jobs {
        tracing::info!(n_complete, "maximum number of finished jobs reached");
        return Ok(false);
    }
    if n_candidates == 0 {
        tracing::info!("no candidates left");
        return Ok(false);
    }
    if n_pending >= options.max_concurrent {
        tracing::debug!(n_pending, "maximum number of jobs in flight; waiting");
        return Ok(true);
    }

    let job_id = match chooser.next(
        &state.snapshot,
        &state.candidates,
        &state.pending,
        &state.complete,
    )? {
        Choice::Existing(id) => {
            if !state.candidates.contains(&id) {
                return Err(anyhow!(
                    "chooser '{}' picked job {} which is not a candidate",
                    chooser.name(),
                    id
                ));
            }
            id
        }
        Choice::New(params) => {
            let id = store.add_to_grid(params)?;
            tracing::debug!(job_id = id, "registered new grid point");
            id
        }
    };

    let params = store.get_params(job_id)?;
    tracing::info!(job_id, "selected job from the grid");
    let job = Job::new(job_id, expt_dir, &expt.name, &expt.main_file, params);
    save_job(&job)?;

    match driver.submit(&job) {
        Some(handle) => {
            store.set_submitted(job_id, handle)?;
            tracing::info!(job_id, pid = %handle, driver = driver.name(), "submitted job");
        }
        None => {
            tracing::error!(job_id, phase = "submit", "failed to submit job");
            remove_job_file(&job)?;
        }
    }
    Ok(true)
}

fn reconcile(state: &GridState, driver: &dyn Driver, store: &dyn GridStore) -> Result<usize> {
    let mut demoted = 0;
    for &job_id in &state.pending {
        let alive = match state.handles.get(&job_id) {
            Some(&handle) => driver.is_alive(job_id, handle),
            None => {
                tracing::warn!(job_id, "pending job has no execution handle");
                false
            }
        };
        if alive {
            continue;
        }
        if store.set_candidate(job_id)? {
            tracing::warn!(job_id, phase = "reconcile", "job is no longer running; returned to candidates");
            demoted += 1;
        }
    }
    Ok(demoted)
}

/// Appends one `timestamp,best_value,best_job_id,n_candidates,n_pending,n_complete`
/// row to `trace.csv`.
pub fn write_trace(expt_dir: &Path, state: &GridState) -> Result<()> {
    let path = trace_path(expt_dir);
    let (best_value, best_id) = best_fields(state);
    let line = format!(
        "{:.6},{},{},{},{},{}",
        Utc::now().timestamp_micros() as f64 / 1e6,
        best_value,
        best_id,
        state.candidates.len(),
        state.pending.len(),
        state.complete.len()
    );
    append_line(&path, &line).with_context(|| format!("failed to write {}", path.display()))
}

pub fn write_best_job(expt_dir: &Path, state: &GridState) -> Result<()> {
    let path = best_job_path(expt_dir);
    let (best_value, best_id) = best_fields(state);
    let mut text = format!("Best result: {}\nJob-id: {}\n", best_value, best_id);
    if let Some((_, id)) = state.best() {
        text.push_str("Parameters:\n");
        for param in state.snapshot.params.get(id as usize).into_iter().flatten() {
            text.push_str(&format!("    {}\n", param));
        }
    }
    atomic_write_bytes(&path, text.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))
}

fn best_fields(state: &GridState) -> (String, String) {
    match state.best() {
        Some((value, id)) => (value.to_string(), id.to_string()),
        None => ("NaN".to_string(), "-1".to_string()),
    }
}

pub fn all_ids(state: &GridState) -> Vec<JobId> {
    let mut ids: Vec<JobId> = state
        .candidates
        .iter()
        .chain(&state.pending)
        .chain(&state.complete)
        .chain(&state.broken)
        .copied()
        .collect();
    ids.sort_unstable();
    ids
}
