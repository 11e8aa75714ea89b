use anyhow::{anyhow, Context, Result};
use optlab_core::{Job, JobId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::local::LocalDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionHandle(pub u64);

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Neither call may block on job completion.
pub trait Driver {
    fn name(&self) -> &'static str;

    /// Launches `job` asynchronously. `None` means nothing was started; the
    /// caller owns cleanup of the job record it already wrote.
    fn submit(&self, job: &Job) -> Option<ExecutionHandle>;

    /// Must return `false` promptly once the execution has terminated for any
    /// reason.
    fn is_alive(&self, job_id: JobId, handle: ExecutionHandle) -> bool;
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub worker_program: PathBuf,
    pub worker_args: Vec<String>,
    pub startup_grace: Duration,
}

impl DriverConfig {
    pub fn new(worker_program: impl Into<PathBuf>, worker_args: Vec<String>) -> Self {
        Self {
            worker_program: worker_program.into(),
            worker_args,
            startup_grace: Duration::from_millis(100),
        }
    }

    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("cannot resolve current executable")?;
        Ok(Self::new(exe, vec!["run-job".to_string()]))
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }
}

pub type DriverCtor = fn(&DriverConfig) -> Result<Box<dyn Driver>>;

pub struct DriverRegistry {
    ctors: BTreeMap<&'static str, DriverCtor>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("local", LocalDriver::from_config);
        registry
    }
}

impl DriverRegistry {
    pub fn empty() -> Self {
        Self {
            ctors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, ctor: DriverCtor) {
        self.ctors.insert(name, ctor);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.ctors.keys().copied().collect()
    }

    pub fn resolve(&self, name: &str, config: &DriverConfig) -> Result<Box<dyn Driver>> {
        let ctor = self.ctors.get(name).ok_or_else(|| {
            anyhow!(
                "unknown driver '{}' (available: {})",
                name,
                self.names().join(", ")
            )
        })?;
        ctor(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_resolves_local_driver() {
        let registry = DriverRegistry::default();
        assert_eq!(registry.names(), vec!["local"]);
        let config = DriverConfig::new("/bin/true", vec![]);
        let driver = registry.resolve("local", &config).expect("local driver");
        assert_eq!(driver.name(), "local");
    }

    #[test]
    fn unknown_driver_is_a_configuration_error() {
        let registry = DriverRegistry::default();
        let config = DriverConfig::new("/bin/true", vec![]);
        let err = registry
            .resolve("sge", &config)
            .err()
            .expect("sge is not registered");
        assert!(err.to_string().contains("unknown driver 'sge'"), "{}", err);
    }

    #[test]
    fn handle_serializes_as_plain_number() {
        let text = serde_json::to_string(&ExecutionHandle(4242)).expect("ser");
        assert_eq!(text, "4242");
    }
}
