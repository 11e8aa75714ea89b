pub mod experiment;
pub mod fsutil;
pub mod job;

pub use experiment::{experiment_dir_for, load_experiment, Experiment, Variable};
pub use fsutil::{append_line, atomic_write_bytes, ensure_dir};
pub use job::{
    job_file_for, job_file_path, job_output_file, load_job, param_map, remove_job_file, save_job,
    save_job_to, Job, JobId, JobStatus, ParamMap, ParamValue, Parameter, RecordError,
};
