// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Slot Locks
//!
//! Cross-process mutual exclusion for worker slots, built on exclusive,
//! non-blocking advisory file locks. One pid file exists per
//! (worker-type, slot-index) pair under the pid directory; whoever holds
//! the flock on it owns that slot, and the file records the owner's OS
//! process id.
//!
//! Lock contention is an expected outcome, not an error: a failed acquire
//! means another process already owns the slot.

use crate::errors::WorkerError;
use nix::{errno::Errno, fcntl::Flock, fcntl::FlockArg};
use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Cross-process slot lock.
///
/// Isolated behind a trait so the coordination primitive can be swapped
/// without touching the supervisor.
pub trait SlotLock {
    /// Attempts to take the lock without blocking. `Ok(false)` means the
    /// slot is owned by another process.
    fn try_acquire(&mut self) -> Result<bool, WorkerError>;

    /// Releases a held lock. A no-op when the lock is not held.
    fn release(&mut self) -> Result<(), WorkerError>;

    /// Reads the OS process id recorded in the lock file, independent of
    /// who currently holds the lock.
    fn owner_pid(&self) -> Result<Option<u32>, WorkerError>;

    /// Records the given process id in the lock file. Requires the lock to
    /// be held.
    fn write_pid(&mut self, pid: u32) -> Result<(), WorkerError>;

    /// Path of the underlying lock file.
    fn path(&self) -> &Path;
}

/// Advisory flock on a pid file.
pub struct PidFileLock {
    path: PathBuf,
    guard: Option<Flock<File>>,
}

impl PidFileLock {
    pub fn new(path: PathBuf) -> Self {
        PidFileLock { path, guard: None }
    }

    /// Lock-file path for a (worker-type, slot) pair:
    /// `<pid_dir>/<worker>/<worker><slot>.pid`.
    pub fn slot_path(pid_dir: &Path, worker: &str, slot: usize) -> PathBuf {
        pid_dir.join(worker).join(format!("{worker}{slot}.pid"))
    }

    /// True while this instance holds the lock.
    pub fn held(&self) -> bool {
        self.guard.is_some()
    }

    fn lock_error(&self, detail: impl ToString) -> WorkerError {
        WorkerError::Lock(self.path.display().to_string(), detail.to_string())
    }
}

impl SlotLock for PidFileLock {
    fn try_acquire(&mut self) -> Result<bool, WorkerError> {
        if self.guard.is_some() {
            return Ok(true);
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => {
                self.guard = Some(guard);
                Ok(true)
            }
            Err((_, Errno::EWOULDBLOCK)) => {
                debug!(path = %self.path.display(), "slot already locked");
                Ok(false)
            }
            Err((_, errno)) => Err(self.lock_error(errno)),
        }
    }

    fn release(&mut self) -> Result<(), WorkerError> {
        if let Some(guard) = self.guard.take() {
            guard
                .unlock()
                .map_err(|(_, errno)| self.lock_error(errno))?;
        }
        Ok(())
    }

    fn owner_pid(&self) -> Result<Option<u32>, WorkerError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.lines().next().and_then(|line| line.trim().parse().ok())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_pid(&mut self, pid: u32) -> Result<(), WorkerError> {
        let Some(guard) = self.guard.as_mut() else {
            return Err(self.lock_error("lock is not held"));
        };

        let file: &mut File = guard;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{pid}")?;
        file.sync_all()?;

        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
