use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use optlab_core::{ensure_dir, job_file_for, job_output_file, Job, JobId};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::driver::{Driver, DriverConfig, ExecutionHandle};

/// Runs each job as a child process on this machine.
///
/// Children spawned by this driver are kept so they can be reaped; pids it
/// did not spawn (e.g. after the dispatcher restarted) are checked with a
/// zero signal. A recycled pid can make a dead job look alive until the
/// unrelated process exits.
#[derive(Debug)]
pub struct LocalDriver {
    program: PathBuf,
    args: Vec<String>,
    startup_grace: Duration,
    children: Mutex<HashMap<u32, Child>>,
}

impl LocalDriver {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            program: config.worker_program.clone(),
            args: config.worker_args.clone(),
            startup_grace: config.startup_grace,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &DriverConfig) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Self::new(config)))
    }

    fn children(&self) -> MutexGuard<'_, HashMap<u32, Child>> {
        match self.children.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn reap_finished(&self) {
        self.children().retain(|pid, child| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(pid, status = %status, "worker process exited");
                false
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "cannot poll worker process");
                false
            }
        });
    }

    fn spawn(&self, job: &Job) -> io::Result<Child> {
        let output_path = job_output_file(job);
        if let Some(parent) = output_path.parent() {
            ensure_dir(parent)?;
        }
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&output_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.arg(job_file_for(job));
        cmd.current_dir(&job.expt_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(log_err));
        cmd.spawn()
    }
}

impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit(&self, job: &Job) -> Option<ExecutionHandle> {
        self.reap_finished();

        let mut child = match self.spawn(job) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    job_id = job.id,
                    program = %self.program.display(),
                    error = %e,
                    "failed to launch worker process"
                );
                return None;
            }
        };
        if !self.startup_grace.is_zero() {
            thread::sleep(self.startup_grace);
        }

        match child.try_wait() {
            Ok(None) => {
                let pid = child.id();
                tracing::info!(job_id = job.id, pid, "submitted job as process");
                self.children().insert(pid, child);
                Some(ExecutionHandle(u64::from(pid)))
            }
            // A worker that already finished cleanly has reported to the grid itself.
            Ok(Some(status)) if status.success() => {
                tracing::info!(job_id = job.id, pid = child.id(), "worker finished during startup");
                Some(ExecutionHandle(u64::from(child.id())))
            }
            Ok(Some(status)) => {
                tracing::error!(
                    job_id = job.id,
                    exit_status = %status,
                    "failed to submit job or job crashed during startup"
                );
                None
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "cannot poll freshly spawned worker");
                let _ = child.kill();
                let _ = child.wait();
                None
            }
        }
    }

    fn is_alive(&self, job_id: JobId, handle: ExecutionHandle) -> bool {
        let Ok(pid) = u32::try_from(handle.0) else {
            return false;
        };
        {
            let mut children = self.children();
            if let Some(child) = children.get_mut(&pid) {
                return match child.try_wait() {
                    Ok(None) => true,
                    Ok(Some(status)) => {
                        tracing::debug!(job_id, pid, status = %status, "worker process has exited");
                        children.remove(&pid);
                        false
                    }
                    Err(e) => {
                        tracing::warn!(job_id, pid, error = %e, "cannot poll worker process");
                        children.remove(&pid);
                        false
                    }
                };
            }
        }
        pid_alive(pid)
    }
}

fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}
