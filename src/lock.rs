use crate::error::ZbakError;
use crate::utils::process_alive;
use crate::Result;
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Pid file guaranteeing a single running instance; released on drop
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    released: bool,
}

impl InstanceLock {
    /// Take the lock, replacing a stale one whose owner is gone
    pub fn acquire(path: &Path) -> Result<Self> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    debug!("acquired lock {}", path.display());
                    return Ok(Self {
                        path: path.to_path_buf(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match read_pid(path) {
                        Some(pid) if process_alive(pid) => {
                            return Err(ZbakError::AlreadyRunning {
                                pid,
                                lock: path.to_path_buf(),
                            });
                        }
                        owner => {
                            warn!(
                                "removing stale lock {} (owner {})",
                                path.display(),
                                owner.map_or_else(|| "unknown".to_string(), |p| p.to_string())
                            );
                            match fs::remove_file(path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        // someone else grabbed it between our removal and re-creation
        let pid = read_pid(path).unwrap_or_default();
        Err(ZbakError::AlreadyRunning {
            pid,
            lock: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&mut self) {
        if !self.released {
            release_lock_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Remove a lock file if it still belongs to this process
pub fn release_lock_file(path: &Path) {
    if read_pid(path) == Some(std::process::id() as i32) {
        if let Err(e) = fs::remove_file(path) {
            warn!("could not remove lock {}: {e}", path.display());
        } else {
            debug!("released lock {}", path.display());
        }
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
