use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Single-instance guarantee via a PID file, per spec §4.1.
///
/// `acquire()` parses any existing file as an integer pid and liveness-probes it with
/// a no-op signal. A live process fails startup with `ALREADY_RUNNING`; a dead or
/// malformed file is removed and rewritten with the current process id at mode
/// `0o600`. `release()` is idempotent and unconditionally removes the file.
pub struct ProcessLock {
    path: PathBuf,
    acquired: bool,
}

impl ProcessLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(existing_pid) = read_pid(&path)? {
            if is_alive(existing_pid) {
                return Err(EngineError::AlreadyRunning(existing_pid));
            }
            warn!(pid = existing_pid, path = %path.display(), "removing stale pid file");
            fs::remove_file(&path)?;
        }

        write_pid(&path, std::process::id())?;
        info!(pid = std::process::id(), path = %path.display(), "pid file acquired");

        Ok(Self {
            path,
            acquired: true,
        })
    }

    pub fn release(&mut self) {
        if !self.acquired {
            return;
        }
        self.acquired = false;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, path = %self.path.display(), "failed to remove pid file");
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(content.trim().parse::<u32>().ok())
}

fn write_pid(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, pid.to_string())?;
    set_owner_only_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    // A no-op signal (0) only checks whether the process exists and is
    // signalable by us; it never actually delivers a signal.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_fails_when_pid_is_alive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        let _first = ProcessLock::acquire(&path).unwrap();
        let second = ProcessLock::acquire(&path);
        assert!(matches!(second, Err(EngineError::AlreadyRunning(_))));
    }

    #[test]
    fn acquire_succeeds_when_pid_is_dead() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        fs::write(&path, "999999999").unwrap();

        let lock = ProcessLock::acquire(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id()));
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn acquire_succeeds_when_file_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        assert!(ProcessLock::acquire(&path).is_ok());
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        let mut lock = ProcessLock::acquire(&path).unwrap();
        lock.release();
        lock.release();
        assert!(!path.exists());
    }
}
