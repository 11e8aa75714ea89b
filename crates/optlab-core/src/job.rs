use crate::fsutil::atomic_write_bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type JobId = u64;

pub type ParamMap = BTreeMap<String, ParamValue>;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("job record not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("corrupt job record {}: {source}", path.display())]
    CorruptRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot serialize job record {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("i/o error on job record {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RecordError {
    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            RecordError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            RecordError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Running,
    Complete,
    Broken,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Broken => "broken",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Broken)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parameter value. The `kind` tag is written explicitly so a scalar never
/// reads back as a one-element array (or an int as a float).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Enum(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Enums(Vec<String>),
}

impl ParamValue {
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Int(v) => Value::from(*v),
            ParamValue::Float(v) => Value::from(*v),
            ParamValue::Enum(v) => Value::from(v.as_str()),
            ParamValue::Ints(v) => Value::from(v.clone()),
            ParamValue::Floats(v) => Value::from(v.clone()),
            ParamValue::Enums(v) => Value::from(v.clone()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            f.write_str("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", item)?;
            }
            f.write_str("]")
        }
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Enum(v) => f.write_str(v),
            ParamValue::Ints(v) => list(f, v),
            ParamValue::Floats(v) => list(f, v),
            ParamValue::Enums(v) => list(f, v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParamValue,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.value)
    }
}

pub fn param_map(params: &[Parameter]) -> ParamMap {
    params
        .iter()
        .map(|p| (p.name.clone(), p.value.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub expt_dir: PathBuf,
    pub name: String,
    pub main_file: String,
    pub status: JobStatus,
    pub submit_t: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_t: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_t: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub params: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Job {
    pub fn new(
        id: JobId,
        expt_dir: &Path,
        name: &str,
        main_file: &str,
        params: Vec<Parameter>,
    ) -> Self {
        Self {
            id,
            expt_dir: expt_dir.to_path_buf(),
            name: name.to_string(),
            main_file: main_file.to_string(),
            status: JobStatus::Submitted,
            submit_t: Utc::now(),
            start_t: None,
            end_t: None,
            duration: None,
            params,
            value: None,
        }
    }

    pub fn param_map(&self) -> ParamMap {
        param_map(&self.params)
    }

    pub fn objective_path(&self) -> PathBuf {
        self.expt_dir.join(&self.main_file)
    }
}

pub fn job_file_path(expt_dir: &Path, id: JobId) -> PathBuf {
    expt_dir.join("jobs").join(format!("{:08}.json", id))
}

pub fn job_file_for(job: &Job) -> PathBuf {
    job_file_path(&job.expt_dir, job.id)
}

pub fn job_output_file(job: &Job) -> PathBuf {
    job.expt_dir.join("output").join(format!("{:08}.out", job.id))
}

pub fn save_job(job: &Job) -> Result<PathBuf, RecordError> {
    let path = job_file_for(job);
    save_job_to(&path, job)?;
    Ok(path)
}

pub fn save_job_to(path: &Path, job: &Job) -> Result<(), RecordError> {
    let bytes = encode_record(path, job)?;
    atomic_write_bytes(path, &bytes).map_err(|e| RecordError::io(path, e))
}

fn encode_record<T: Serialize>(path: &Path, record: &T) -> Result<Vec<u8>, RecordError> {
    serde_json::to_vec_pretty(record).map_err(|source| RecordError::Serialize {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_job(path: &Path) -> Result<Job, RecordError> {
    let bytes = fs::read(path).map_err(|e| RecordError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| RecordError::CorruptRecord {
        path: path.to_path_buf(),
        source,
    })
}

pub fn remove_job_file(job: &Job) -> Result<bool, RecordError> {
    let path = job_file_for(job);
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RecordError::io(&path, e)),
    }
}
