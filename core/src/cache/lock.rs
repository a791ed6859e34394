/*
 * lock.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, a resource-fetching engine.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Advisory named locks shared between processes using one cache directory.
//!
//! A lock is a file created with `create_new`, holding the owner's process id. Acquisition spins
//! for a bounded time; a lock whose owner process is gone is taken over.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use super::{process_alive, CacheError};

/// Spin budget for per-entry metadata locks.
pub const ENTRY_LOCK_SPIN: Duration = Duration::from_millis(50);

/// Held lock; the file is removed on drop.
#[derive(Debug)]
pub struct NamedLock {
    path: PathBuf,
}

impl NamedLock {
    /// Try once. `Ok(None)` when another live process holds it.
    pub fn try_acquire(path: &Path, pid: u32) -> Result<Option<NamedLock>, CacheError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(pid.to_string().as_bytes())?;
                trace!(target: "corriere::cache", lock = %path.display(), "lock acquired");
                Ok(Some(NamedLock {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Some(owner) = read_owner(path) {
                    if owner != pid && !process_alive(owner) {
                        warn!(target: "corriere::cache", lock = %path.display(), owner, "removing stale lock");
                        let _ = fs::remove_file(path);
                        return Self::try_acquire_fresh(path, pid);
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_acquire_fresh(path: &Path, pid: u32) -> Result<Option<NamedLock>, CacheError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(pid.to_string().as_bytes())?;
                Ok(Some(NamedLock {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Spin until acquired or `spin` elapses.
    pub fn acquire(path: &Path, pid: u32, spin: Duration) -> Result<NamedLock, CacheError> {
        let start = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(path, pid)? {
                return Ok(lock);
            }
            if start.elapsed() >= spin {
                return Err(CacheError::LockTimeout(path.display().to_string()));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(target: "corriere::cache", lock = %self.path.display(), "failed to release lock: {}", e);
            }
        }
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    let mut s = String::new();
    fs::File::open(path).ok()?.read_to_string(&mut s).ok()?;
    s.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let me = std::process::id();
        let held = NamedLock::acquire(&path, me, ENTRY_LOCK_SPIN).unwrap();
        let err = NamedLock::acquire(&path, me, Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout(_)));
        drop(held);
        assert!(!path.exists());
        assert!(NamedLock::acquire(&path, me, ENTRY_LOCK_SPIN).is_ok());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.lock");
        // Far beyond any pid_max.
        fs::write(&path, "2147483000").unwrap();
        let lock = NamedLock::try_acquire(&path, std::process::id()).unwrap();
        assert!(lock.is_some());
    }
}
