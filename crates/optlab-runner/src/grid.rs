use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use optlab_core::{atomic_write_bytes, JobId, ParamValue, Parameter, Variable};
use rand::rngs::StdRng;
use rand::distr::{Distribution, Uniform};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::driver::ExecutionHandle;
use crate::lock::GridLock;

const GRID_SCHEMA_VERSION: &str = "expt_grid_v1";
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a job id sits in its lifecycle. `Submitted` and `Running` together
/// form the pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridStatus {
    Candidate,
    Submitted,
    Running,
    Complete,
    Broken,
}

impl GridStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, GridStatus::Submitted | GridStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GridStatus::Complete | GridStatus::Broken)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GridStatus::Candidate => "candidate",
            GridStatus::Submitted => "submitted",
            GridStatus::Running => "running",
            GridStatus::Complete => "complete",
            GridStatus::Broken => "broken",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridSnapshot {
    pub params: Vec<Vec<Parameter>>,
    pub values: Vec<f64>,
    pub durations: Vec<f64>,
}

impl GridSnapshot {
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GridState {
    pub snapshot: GridSnapshot,
    pub candidates: Vec<JobId>,
    pub pending: Vec<JobId>,
    pub complete: Vec<JobId>,
    pub broken: Vec<JobId>,
    pub handles: BTreeMap<JobId, ExecutionHandle>,
}

impl GridState {
    /// Lowest observed value among complete jobs (ties go to the lower id).
    pub fn best(&self) -> Option<(f64, JobId)> {
        let mut best: Option<(f64, JobId)> = None;
        for &id in &self.complete {
            let Some(&value) = self.snapshot.values.get(id as usize) else {
                continue;
            };
            if value.is_nan() {
                continue;
            }
            match best {
                Some((v, _)) if v <= value => {}
                _ => best = Some((value, id)),
            }
        }
        best
    }
}

/// Shared experiment state consumed by the dispatcher and every worker.
///
/// Implementations serialize each call internally; callers never hold a lock
/// across calls.
pub trait GridStore {
    fn load_state(&self) -> Result<GridState>;
    fn get_params(&self, id: JobId) -> Result<Vec<Parameter>>;
    fn add_to_grid(&self, params: Vec<Parameter>) -> Result<JobId>;
    /// Demotes a pending id back to candidate. Returns `false` (and changes
    /// nothing) if the id is not pending.
    fn set_candidate(&self, id: JobId) -> Result<bool>;
    fn set_submitted(&self, id: JobId, handle: ExecutionHandle) -> Result<()>;
    fn job_running(&self, id: JobId) -> Result<()>;
    fn job_complete(&self, id: JobId, value: f64, duration: f64) -> Result<()>;
    fn job_broken(&self, id: JobId) -> Result<()>;

    fn get_best(&self) -> Result<Option<(f64, JobId)>> {
        Ok(self.load_state()?.best())
    }

    fn get_grid(&self) -> Result<GridSnapshot> {
        Ok(self.load_state()?.snapshot)
    }

    fn get_candidates(&self) -> Result<Vec<JobId>> {
        Ok(self.load_state()?.candidates)
    }

    fn get_pending(&self) -> Result<Vec<JobId>> {
        Ok(self.load_state()?.pending)
    }

    fn get_complete(&self) -> Result<Vec<JobId>> {
        Ok(self.load_state()?.complete)
    }

    fn get_broken(&self) -> Result<Vec<JobId>> {
        Ok(self.load_state()?.broken)
    }

    fn get_handle(&self, id: JobId) -> Result<Option<ExecutionHandle>> {
        Ok(self.load_state()?.handles.get(&id).copied())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GridEntry {
    params: Vec<Parameter>,
    status: GridStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    handle: Option<ExecutionHandle>,
    updated_at: DateTime<Utc>,
}

impl GridEntry {
    fn candidate(params: Vec<Parameter>) -> Self {
        Self {
            params,
            status: GridStatus::Candidate,
            value: None,
            duration: None,
            handle: None,
            updated_at: Utc::now(),
        }
    }

    fn set_status(&mut self, status: GridStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GridFile {
    schema_version: String,
    variables: Vec<Variable>,
    seed: u64,
    jobs: Vec<GridEntry>,
}

impl GridFile {
    fn entry_mut(&mut self, id: JobId) -> Result<&mut GridEntry> {
        self.jobs
            .get_mut(id as usize)
            .ok_or_else(|| anyhow!("unknown job id {}", id))
    }

    fn state(&self) -> GridState {
        let mut state = GridState::default();
        for (idx, entry) in self.jobs.iter().enumerate() {
            let id = idx as JobId;
            state.snapshot.params.push(entry.params.clone());
            state.snapshot.values.push(entry.value.unwrap_or(f64::NAN));
            state.snapshot.durations.push(entry.duration.unwrap_or(f64::NAN));
            match entry.status {
                GridStatus::Candidate => state.candidates.push(id),
                GridStatus::Submitted | GridStatus::Running => state.pending.push(id),
                GridStatus::Complete => state.complete.push(id),
                GridStatus::Broken => state.broken.push(id),
            }
            if let Some(handle) = entry.handle {
                state.handles.insert(id, handle);
            }
        }
        state
    }
}

#[derive(Debug, Clone)]
pub struct FileGridStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl FileGridStore {
    pub fn grid_path(expt_dir: &Path) -> PathBuf {
        expt_dir.join("expt-grid.json")
    }

    fn at(expt_dir: &Path) -> Self {
        Self {
            path: Self::grid_path(expt_dir),
            lock_path: expt_dir.join("expt-grid.lock"),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn open(expt_dir: &Path) -> Result<Self> {
        let store = Self::at(expt_dir);
        if !store.path.exists() {
            return Err(anyhow!("no experiment grid at {}", store.path.display()));
        }
        Ok(store)
    }

    /// Opens the grid, sampling `grid_size` initial candidates on first use.
    /// An existing grid must have been built from the same variables.
    pub fn create_or_open(
        expt_dir: &Path,
        variables: &[Variable],
        grid_size: usize,
        seed: u64,
    ) -> Result<Self> {
        let store = Self::at(expt_dir);
        let _lock = GridLock::acquire(&store.lock_path, store.lock_timeout)?;
        if store.path.exists() {
            let grid = store.read_unlocked()?;
            if grid.variables != variables {
                return Err(anyhow!(
                    "experiment variables no longer match the grid at {}",
                    store.path.display()
                ));
            }
            return Ok(store);
        }
        let grid = GridFile {
            schema_version: GRID_SCHEMA_VERSION.to_string(),
            variables: variables.to_vec(),
            seed,
            jobs: sample_grid(variables, grid_size, seed)?
                .into_iter()
                .map(GridEntry::candidate)
                .collect(),
        };
        store.write_unlocked(&grid)?;
        tracing::info!(
            grid = %store.path.display(),
            grid_size,
            seed,
            "created experiment grid"
        );
        Ok(store)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_unlocked(&self) -> Result<GridFile> {
        let bytes = fs::read(&self.path)
            .with_context(|| format!("failed to read grid {}", self.path.display()))?;
        let grid: GridFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt grid {}", self.path.display()))?;
        if grid.schema_version != GRID_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported grid schema '{}' in {}",
                grid.schema_version,
                self.path.display()
            ));
        }
        Ok(grid)
    }

    fn write_unlocked(&self, grid: &GridFile) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(grid)?;
        atomic_write_bytes(&self.path, &bytes)
            .with_context(|| format!("failed to write grid {}", self.path.display()))
    }

    fn read(&self) -> Result<GridFile> {
        let _lock = GridLock::acquire(&self.lock_path, self.lock_timeout)?;
        self.read_unlocked()
    }

    fn update<T>(&self, f: impl FnOnce(&mut GridFile) -> Result<(T, bool)>) -> Result<T> {
        let _lock = GridLock::acquire(&self.lock_path, self.lock_timeout)?;
        let mut grid = self.read_unlocked()?;
        let (out, changed) = f(&mut grid)?;
        if changed {
            self.write_unlocked(&grid)?;
        }
        Ok(out)
    }
}

impl GridStore for FileGridStore {
    fn load_state(&self) -> Result<GridState> {
        Ok(self.read()?.state())
    }

    fn get_params(&self, id: JobId) -> Result<Vec<Parameter>> {
        self.read()?
            .jobs
            .get(id as usize)
            .map(|e| e.params.clone())
            .ok_or_else(|| anyhow!("unknown job id {}", id))
    }

    fn add_to_grid(&self, params: Vec<Parameter>) -> Result<JobId> {
        self.update(|grid| {
            grid.jobs.push(GridEntry::candidate(params));
            Ok(((grid.jobs.len() - 1) as JobId, true))
        })
    }

    fn set_candidate(&self, id: JobId) -> Result<bool> {
        self.update(|grid| {
            let entry = grid.entry_mut(id)?;
            if !entry.status.is_pending() {
                tracing::debug!(job_id = id, status = entry.status.as_str(), "not pending; left as is");
                return Ok((false, false));
            }
            entry.set_status(GridStatus::Candidate);
            entry.handle = None;
            Ok((true, true))
        })
    }

    fn set_submitted(&self, id: JobId, handle: ExecutionHandle) -> Result<()> {
        self.update(|grid| {
            let entry = grid.entry_mut(id)?;
            entry.handle = Some(handle);
            // The worker may already have reported in; never move it backwards.
            if entry.status == GridStatus::Candidate {
                entry.set_status(GridStatus::Submitted);
            }
            Ok(((), true))
        })
    }

    fn job_running(&self, id: JobId) -> Result<()> {
        self.update(|grid| {
            let entry = grid.entry_mut(id)?;
            if entry.status.is_terminal() {
                return Err(anyhow!("job {} is already {}", id, entry.status.as_str()));
            }
            entry.set_status(GridStatus::Running);
            Ok(((), true))
        })
    }

    fn job_complete(&self, id: JobId, value: f64, duration: f64) -> Result<()> {
        self.update(|grid| {
            let entry = grid.entry_mut(id)?;
            if entry.status.is_terminal() {
                return Err(anyhow!("job {} is already {}", id, entry.status.as_str()));
            }
            entry.value = Some(value);
            entry.duration = Some(duration);
            entry.set_status(GridStatus::Complete);
            Ok(((), true))
        })
    }

    fn job_broken(&self, id: JobId) -> Result<()> {
        self.update(|grid| {
            let entry = grid.entry_mut(id)?;
            if entry.status.is_terminal() {
                return Err(anyhow!("job {} is already {}", id, entry.status.as_str()));
            }
            entry.set_status(GridStatus::Broken);
            Ok(((), true))
        })
    }
}

/// Draws `size` points uniformly from the declared variables; same seed, same grid.
pub fn sample_grid(variables: &[Variable], size: usize, seed: u64) -> Result<Vec<Vec<Parameter>>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points = Vec::with_capacity(size);
    for _ in 0..size {
        let mut point = Vec::with_capacity(variables.len());
        for var in variables {
            point.push(Parameter::new(var.name(), sample_variable(var, &mut rng)?));
        }
        points.push(point);
    }
    Ok(points)
}

fn sample_variable(var: &Variable, rng: &mut StdRng) -> Result<ParamValue> {
    let range_error =
        |e: rand::distr::uniform::Error| anyhow!("variable '{}': cannot sample range: {}", var.name(), e);
    let value = match var {
        Variable::Int { size, min, max, .. } => {
            let dist = Uniform::new_inclusive(*min, *max).map_err(range_error)?;
            let mut draws: Vec<i64> = (0..*size).map(|_| dist.sample(&mut *rng)).collect();
            if *size == 1 {
                ParamValue::Int(draws.remove(0))
            } else {
                ParamValue::Ints(draws)
            }
        }
        Variable::Float { size, min, max, .. } => {
            let dist = Uniform::new_inclusive(*min, *max).map_err(range_error)?;
            let mut draws: Vec<f64> = (0..*size).map(|_| dist.sample(&mut *rng)).collect();
            if *size == 1 {
                ParamValue::Float(draws.remove(0))
            } else {
                ParamValue::Floats(draws)
            }
        }
        Variable::Enum { size, options, .. } => {
            let dist = Uniform::new(0, options.len()).map_err(range_error)?;
            let mut draws: Vec<String> = (0..*size)
                .map(|_| options[dist.sample(&mut *rng)].clone())
                .collect();
            if *size == 1 {
                ParamValue::Enum(draws.remove(0))
            } else {
                ParamValue::Enums(draws)
            }
        }
    };
    Ok(value)
}
