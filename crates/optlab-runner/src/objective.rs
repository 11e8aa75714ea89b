use anyhow::{anyhow, Context, Result};
use optlab_core::{Job, JobId, ParamMap};
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

const STDERR_TAIL_LINES: usize = 20;

pub trait Objective {
    fn evaluate(&self, job_id: JobId, params: &ParamMap) -> Result<f64>;
}

impl<F> Objective for F
where
    F: Fn(JobId, &ParamMap) -> Result<f64>,
{
    fn evaluate(&self, job_id: JobId, params: &ParamMap) -> Result<f64> {
        self(job_id, params)
    }
}

/// Runs the experiment's declared objective file as its own process.
///
/// The child gets `{"job_id": N, "params": {...}}` on stdin and
/// `OPTLAB_JOB_ID` in its environment, runs inside the experiment directory,
/// and reports its result as the last non-empty stdout line: either a bare
/// number or `{"value": number}`.
#[derive(Debug, Clone)]
pub struct CommandObjective {
    program: PathBuf,
    working_dir: PathBuf,
}

impl CommandObjective {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            working_dir: working_dir.into(),
        }
    }

    pub fn for_job(job: &Job) -> Self {
        Self::new(job.objective_path(), &job.expt_dir)
    }
}

impl Objective for CommandObjective {
    fn evaluate(&self, job_id: JobId, params: &ParamMap) -> Result<f64> {
        if !self.program.is_file() {
            return Err(anyhow!(
                "objective file not found: {}",
                self.program.display()
            ));
        }
        let payload = objective_input(job_id, params);
        let input = serde_json::to_vec(&payload)?;

        let mut child = Command::new(&self.program)
            .current_dir(&self.working_dir)
            .env("OPTLAB_JOB_ID", job_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start objective {}", self.program.display()))?;
        if let Some(mut stdin) = child.stdin.take() {
            // An objective that ignores its input may close stdin early.
            let _ = stdin.write_all(&input);
        }
        let output = child
            .wait_with_output()
            .context("failed to wait for objective process")?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            let _ = std::io::stderr().write_all(stderr.as_bytes());
        }
        if !output.status.success() {
            return Err(anyhow!(
                "objective exited with {}: {}",
                output.status,
                stderr_tail(&stderr)
            ));
        }
        parse_objective_output(&String::from_utf8_lossy(&output.stdout))
    }
}

fn objective_input(job_id: JobId, params: &ParamMap) -> Value {
    let flat: serde_json::Map<String, Value> = params
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect();
    json!({
        "job_id": job_id,
        "params": flat,
    })
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return "no stderr output".to_string();
    }
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

pub fn parse_objective_output(stdout: &str) -> Result<f64> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("objective printed no result"))?;
    let value = match line.parse::<f64>() {
        Ok(v) => v,
        Err(_) => {
            let parsed: Value = serde_json::from_str(line)
                .with_context(|| format!("unrecognised objective result: {}", line))?;
            let number = match &parsed {
                Value::Object(map) => map.get("value"),
                other => Some(other),
            };
            number
                .and_then(Value::as_f64)
                .ok_or_else(|| anyhow!("objective result has no numeric value: {}", line))?
        }
    };
    if !value.is_finite() {
        return Err(anyhow!("objective returned a non-finite value: {}", value));
    }
    Ok(value)
}
