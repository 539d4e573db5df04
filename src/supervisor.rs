// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Supervision
//!
//! Out-of-process worker launching. Each worker type runs as one or more
//! independent OS processes, one per slot, each guarded by an advisory
//! pid-file lock so at most `parallelism` instances of a type run at once.
//!
//! The parent acquires a slot lock, spawns a detached child re-invoking the
//! embedding application with the worker name, records the child's pid in
//! the lock file and releases its own hold. The child then finds the pid
//! file naming its own pid, re-acquires the lock and runs the worker until
//! a shutdown signal drains it.
//!
//! Draining is a persisted marker checked at spawn time only: a worker that
//! is already consuming does not observe the marker until it exits and is
//! restarted. Stopping is a hard kill of every recorded pid.

use crate::{
    configs::WorkerConfigs,
    errors::WorkerError,
    lock::{PidFileLock, SlotLock},
    shutdown::Shutdown,
    worker::WorkerRegistry,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    process::Stdio,
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Persisted request for a graceful drain.
#[derive(Debug, Serialize, Deserialize)]
pub struct DrainMarker {
    pub time: DateTime<Utc>,
}

/// Launches, drains and stops worker processes.
pub struct WorkerSupervisor {
    workers: WorkerRegistry,
    pid_dir: PathBuf,
    drain_file: PathBuf,
    log_file: Option<PathBuf>,
    command: Vec<String>,
}

impl WorkerSupervisor {
    pub fn new(workers: WorkerRegistry, cfgs: &WorkerConfigs) -> Self {
        WorkerSupervisor {
            workers,
            pid_dir: cfgs.pid_dir.clone(),
            drain_file: cfgs.drain_file.clone(),
            log_file: cfgs.log_file.clone(),
            command: cfgs.command.clone(),
        }
    }

    /// Spawns every registered worker type into its free slots.
    ///
    /// Any previously persisted drain marker is cleared first. Slots whose
    /// lock is already held are skipped: another process owns them. The
    /// drain marker is re-checked between spawns, never inside a running
    /// consume loop.
    pub async fn start_all(&self) -> Result<(), WorkerError> {
        self.clear_drain()?;

        for worker in self.workers.iter() {
            let name = worker.name();
            std::fs::create_dir_all(self.pid_dir.join(name))?;

            for slot in 0..worker.parallelism() {
                if self.drain_active()? {
                    info!("drain requested, not spawning further slots");
                    return Ok(());
                }

                let mut lock =
                    PidFileLock::new(PidFileLock::slot_path(&self.pid_dir, name, slot));

                if !lock.try_acquire()? {
                    debug!(worker = name, slot = slot, "slot taken, trying next");
                    continue;
                }

                let pid = self.spawn_worker(name).await?;
                lock.write_pid(pid)?;
                lock.release()?;

                info!(worker = name, slot = slot, pid = pid, "worker spawned");
            }
        }

        Ok(())
    }

    /// Child-side entry point: re-acquires the slot lock recorded for this
    /// process and runs the worker until drained.
    ///
    /// Exits quietly when no slot records this pid or the lock was lost;
    /// in both cases another process owns the slot and running would break
    /// slot exclusivity.
    pub async fn run_child(&self, name: &str) -> Result<(), WorkerError> {
        let worker = self.workers.get(name)?;

        // Give the parent time to record our pid before scanning.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let pid = std::process::id();
        let Some(mut lock) = self.find_own_slot(name, pid)? else {
            info!(worker = name, pid = pid, "no slot records this pid, exiting");
            return Ok(());
        };

        if !lock.try_acquire()? {
            info!(
                worker = name,
                pid = pid,
                path = %lock.path().display(),
                "slot lock lost, exiting"
            );
            return Ok(());
        }

        info!(worker = name, pid = pid, "slot lock re-acquired, running");

        let shutdown = Shutdown::new();
        shutdown.listen_for_signals();

        let result = worker.run(shutdown).await;
        lock.release()?;
        result
    }

    /// Persists the drain marker. Consumers finish their in-flight message;
    /// no new consumption loop starts while the marker is present.
    pub fn drain(&self) -> Result<(), WorkerError> {
        if let Some(parent) = self.drain_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let marker = DrainMarker { time: Utc::now() };
        std::fs::write(&self.drain_file, serde_json::to_string_pretty(&marker)?)?;

        info!(path = %self.drain_file.display(), "workers are draining");
        Ok(())
    }

    /// Removes the drain marker if present.
    pub fn clear_drain(&self) -> Result<(), WorkerError> {
        match std::fs::remove_file(&self.drain_file) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// True while a parseable drain marker is persisted.
    pub fn drain_active(&self) -> Result<bool, WorkerError> {
        match std::fs::read_to_string(&self.drain_file) {
            Ok(raw) => {
                let _: DrainMarker = serde_json::from_str(&raw)?;
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Hard stop: SIGKILL every pid whose slot lock is still held.
    ///
    /// Distinct from drain: in-flight messages are dropped and requeued by
    /// the broker once the connections die. Returns how many processes
    /// were signalled.
    ///
    /// A slot whose lock can be taken here is free: its worker already
    /// exited and the recorded pid may have been recycled by the OS, so it
    /// must never be signalled. The stale record is truncated instead.
    pub fn stop(&self) -> Result<usize, WorkerError> {
        let mut killed = 0;

        for worker in self.workers.iter() {
            for mut lock in self.slot_locks(worker.name())? {
                if lock.try_acquire()? {
                    std::fs::write(lock.path(), b"")?;
                    lock.release()?;
                    debug!(
                        worker = worker.name(),
                        path = %lock.path().display(),
                        "slot is free, nothing to kill"
                    );
                    continue;
                }

                let Some(pid) = lock.owner_pid()? else {
                    continue;
                };

                #[cfg(unix)]
                {
                    use nix::sys::signal::{kill, Signal};
                    use nix::unistd::Pid;

                    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        Ok(()) => {
                            info!(worker = worker.name(), pid = pid, "worker killed");
                            killed += 1;
                        }
                        Err(nix::errno::Errno::ESRCH) => {
                            debug!(worker = worker.name(), pid = pid, "worker already gone");
                        }
                        Err(errno) => {
                            warn!(
                                worker = worker.name(),
                                pid = pid,
                                error = errno.to_string(),
                                "failure to kill worker"
                            );
                        }
                    }
                }
            }
        }

        Ok(killed)
    }

    /// Runs one named worker in the foreground, bypassing the lock and
    /// process-spawn machinery. For interactive debugging only.
    pub async fn debug_run(&self, name: &str) -> Result<(), WorkerError> {
        let worker = self.workers.get(name)?;

        warn!(worker = name, "running in the foreground, press Ctrl-C to stop");

        let shutdown = Shutdown::new();
        shutdown.listen_for_signals();

        worker.run(shutdown).await
    }

    /// Command line for launching a worker child. Defaults to re-invoking
    /// the current executable as `<exe> worker <name>`.
    fn launch_command(&self, name: &str) -> Result<Vec<String>, WorkerError> {
        let mut argv = if self.command.is_empty() {
            let exe = std::env::current_exe()?;
            vec![exe.to_string_lossy().into_owned(), "worker".to_owned()]
        } else {
            self.command.clone()
        };

        argv.push(name.to_owned());
        Ok(argv)
    }

    async fn spawn_worker(&self, name: &str) -> Result<u32, WorkerError> {
        let argv = self.launch_command(name)?;

        debug!(worker = name, command = argv.join(" "), "spawning worker");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(Stdio::null());

        match &self.log_file {
            Some(path) => {
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                cmd.stdout(Stdio::from(log.try_clone()?));
                cmd.stderr(Stdio::from(log));
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }

        // Own process group: the child must survive the launcher's exit
        // and its terminal signals.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|err| {
            error!(worker = name, error = err.to_string(), "failure to spawn worker");
            WorkerError::Spawn(name.to_owned())
        })?;

        child.id().ok_or_else(|| WorkerError::Spawn(name.to_owned()))
    }

    /// Finds the slot lock file recording the given pid.
    fn find_own_slot(&self, name: &str, pid: u32) -> Result<Option<PidFileLock>, WorkerError> {
        for lock in self.slot_locks(name)? {
            if lock.owner_pid()? == Some(pid) {
                return Ok(Some(lock));
            }
        }
        Ok(None)
    }

    fn slot_locks(&self, name: &str) -> Result<Vec<PidFileLock>, WorkerError> {
        let dir = self.pid_dir.join(name);
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut locks = vec![];
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "pid") {
                locks.push(PidFileLock::new(path));
            }
        }

        Ok(locks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{MockWorker, Worker, WorkerRegistry};
    use std::sync::Arc;

    fn worker_named(name: &str) -> Arc<dyn Worker> {
        let mut worker = MockWorker::new();
        worker.expect_name().return_const(name.to_owned());
        worker.expect_parallelism().return_const(1usize);
        Arc::new(worker)
    }

    fn supervisor_in(dir: &std::path::Path, workers: WorkerRegistry) -> WorkerSupervisor {
        let cfgs = WorkerConfigs {
            pid_dir: dir.join("pids"),
            drain_file: dir.join("framework/drain"),
            log_file: None,
            command: vec![],
        };
        WorkerSupervisor::new(workers, &cfgs)
    }

    #[test]
    fn drain_marker_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_in(dir.path(), WorkerRegistry::new());

        assert!(!supervisor.drain_active().unwrap());

        supervisor.drain().unwrap();
        assert!(supervisor.drain_active().unwrap());

        let raw = std::fs::read_to_string(dir.path().join("framework/drain")).unwrap();
        let marker: DrainMarker = serde_json::from_str(&raw).unwrap();
        assert!(marker.time <= Utc::now());

        supervisor.clear_drain().unwrap();
        assert!(!supervisor.drain_active().unwrap());
    }

    #[test]
    fn clear_drain_tolerates_a_missing_marker() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_in(dir.path(), WorkerRegistry::new());

        supervisor.clear_drain().unwrap();
        supervisor.clear_drain().unwrap();
    }

    #[test]
    fn launch_command_defaults_to_current_exe() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_in(dir.path(), WorkerRegistry::new());

        let argv = supervisor.launch_command("claims").unwrap();

        assert!(argv.len() >= 3);
        assert_eq!(argv[argv.len() - 2], "worker");
        assert_eq!(argv[argv.len() - 1], "claims");
    }

    #[test]
    fn launch_command_appends_the_worker_name_to_the_override() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor_in(dir.path(), WorkerRegistry::new());
        supervisor.command = vec!["php".to_owned(), "artisan".to_owned(), "worker:run".to_owned()];

        let argv = supervisor.launch_command("claims").unwrap();
        assert_eq!(argv, vec!["php", "artisan", "worker:run", "claims"]);
    }

    #[test]
    fn find_own_slot_matches_the_recorded_pid() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            supervisor_in(dir.path(), WorkerRegistry::new().register(worker_named("claims")));

        let path = PidFileLock::slot_path(&supervisor.pid_dir, "claims", 0);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "4242\n").unwrap();

        assert!(supervisor.find_own_slot("claims", 4242).unwrap().is_some());
        assert!(supervisor.find_own_slot("claims", 1).unwrap().is_none());
    }

    #[test]
    fn slot_locks_are_empty_without_a_pid_dir() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_in(dir.path(), WorkerRegistry::new());

        assert!(supervisor.slot_locks("claims").unwrap().is_empty());
    }

    #[test]
    fn stop_skips_slots_whose_lock_is_free() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            supervisor_in(dir.path(), WorkerRegistry::new().register(worker_named("claims")));

        // A stale record: the worker exited, nothing holds the flock, and
        // the pid may since have been recycled by the OS.
        let path = PidFileLock::slot_path(&supervisor.pid_dir, "claims", 0);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        assert_eq!(supervisor.stop().unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn stop_kills_only_held_slots() {
        use std::os::unix::process::ExitStatusExt;

        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            supervisor_in(dir.path(), WorkerRegistry::new().register(worker_named("claims")));

        let mut child = std::process::Command::new("sleep")
            .arg("300")
            .spawn()
            .unwrap();

        let path = PidFileLock::slot_path(&supervisor.pid_dir, "claims", 0);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut lock = PidFileLock::new(path);
        assert!(lock.try_acquire().unwrap());
        lock.write_pid(child.id()).unwrap();

        assert_eq!(supervisor.stop().unwrap(), 1);

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(9));

        lock.release().unwrap();
    }

    #[test]
    fn stop_with_no_recorded_pids_kills_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            supervisor_in(dir.path(), WorkerRegistry::new().register(worker_named("claims")));

        assert_eq!(supervisor.stop().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_child_exits_quietly_when_no_slot_records_the_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = MockWorker::new();
        worker.expect_name().return_const("claims".to_owned());
        // run must never be called without a held slot lock
        worker.expect_run().never();

        let supervisor = supervisor_in(
            dir.path(),
            WorkerRegistry::new().register(Arc::new(worker)),
        );

        supervisor.run_child("claims").await.unwrap();
    }

    #[tokio::test]
    async fn debug_run_invokes_the_worker_directly() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = MockWorker::new();
        worker.expect_name().return_const("claims".to_owned());
        worker.expect_run().returning(|_| Ok(()));

        let supervisor = supervisor_in(
            dir.path(),
            WorkerRegistry::new().register(Arc::new(worker)),
        );

        supervisor.debug_run("claims").await.unwrap();
    }

    #[tokio::test]
    async fn debug_run_rejects_unknown_workers() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_in(dir.path(), WorkerRegistry::new());

        let err = supervisor.debug_run("missing").await.unwrap_err();
        assert!(matches!(err, WorkerError::UnknownWorker(_)));
    }
}
