use anyhow::{anyhow, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

// flock on the lock file, released by the kernel when the holder exits or dies.
// The file is never unlinked: a second process would lock a fresh inode.
pub struct GridLock {
    path: PathBuf,
    file: Flock<File>,
}

impl GridLock {
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| anyhow::Error::new(e).context(format!("cannot open lock file {}", path.display())))?;
        let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EINTR => return Ok(None),
            Err((_, errno)) => {
                return Err(anyhow!("cannot lock {}: {}", path.display(), errno));
            }
        };
        // Owner line is informational only; the kernel lock is what excludes.
        let owner = format!(
            "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        if file.set_len(0).is_ok() {
            let _ = file.write_all(owner.as_bytes());
        }
        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
        }))
    }

    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "timed out after {:?} waiting for lock {}",
                    timeout,
                    path.display()
                ));
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder_pid(&self) -> Option<u32> {
        let raw = fs::read(&self.path).ok()?;
        let owner: serde_json::Value = serde_json::from_slice(&raw).ok()?;
        owner.get("pid")?.as_u64().and_then(|pid| u32::try_from(pid).ok())
    }
}

impl fmt::Debug for GridLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridLock").field("path", &self.path).finish()
    }
}

impl Drop for GridLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
    }
}
