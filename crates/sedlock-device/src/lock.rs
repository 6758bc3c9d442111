//! Pid-stamped lock files granting one process exclusive use of a drive.
//!
//! The pid is written to a private file first and hard-linked into place, so
//! a lock file is never observed without its owner.

use log::{debug, warn};
use sedlock_core::error::{SedError, SedResult};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Debug)]
pub(crate) struct DeviceLock {
    path: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
enum Owner {
    Pid(u32),
    Empty,
    Unreadable,
}

impl DeviceLock {
    /// Take the lock for `device` under `lock_dir`, reclaiming it from dead owners.
    pub(crate) fn acquire(lock_dir: &Path, device: &Path) -> SedResult<Self> {
        fs::create_dir_all(lock_dir)?;
        let name = lock_name(device);
        let path = lock_dir.join(&name);
        let staged = lock_dir.join(format!(".{name}.{}", process::id()));
        fs::write(&staged, format!("{}\n", process::id()))?;
        let result = Self::publish(&staged, &path, device);
        if let Err(err) = fs::remove_file(&staged) {
            warn!("failed to remove {}: {err}", staged.display());
        }
        result
    }

    fn publish(staged: &Path, path: &Path, device: &Path) -> SedResult<Self> {
        for _ in 0..2 {
            match fs::hard_link(staged, path) {
                Ok(()) => {
                    debug!("locked {} via {}", device.display(), path.display());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let owner = read_owner(path);
                    match owner {
                        Owner::Pid(pid) if pid == process::id() || process_alive(pid) => {
                            return Err(busy(device, format!("held by process {pid}")));
                        }
                        Owner::Empty => {
                            return Err(busy(device, "lock file is being written".into()));
                        }
                        _ => {
                            // another process may have reclaimed it since we looked
                            if read_owner(path) != owner {
                                continue;
                            }
                            warn!("removing stale lock {} (owner {owner:?})", path.display());
                            match fs::remove_file(path) {
                                Ok(()) => {}
                                Err(err) if err.kind() == ErrorKind::NotFound => {}
                                Err(err) => return Err(err.into()),
                            }
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(busy(device, "lock contended".into()))
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to remove lock {}: {err}", self.path.display());
        }
    }
}

fn busy(device: &Path, reason: String) -> SedError {
    SedError::DeviceBusy {
        path: device.to_path_buf(),
        reason,
    }
}

fn lock_name(device: &Path) -> String {
    let name: String = device
        .to_string_lossy()
        .trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{name}.lock")
}

fn read_owner(path: &Path) -> Owner {
    match fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Owner::Empty,
        Ok(text) => text
            .trim()
            .parse()
            .map(Owner::Pid)
            .unwrap_or(Owner::Unreadable),
        Err(err) if err.kind() == ErrorKind::NotFound => Owner::Unreadable,
        Err(_) => Owner::Empty,
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
