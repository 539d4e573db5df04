// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Types
//!
//! A worker is a long-running consumer loop with a name and a configured
//! parallelism. Worker types are registered in a [`WorkerRegistry`] at
//! process startup; the supervisor spawns one OS process per (worker, slot)
//! pair and looks the worker up by name inside the child.

use crate::{errors::WorkerError, shutdown::Shutdown};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

/// A supervised worker type.
///
/// `run` owns the process until a shutdown trigger drains it; most
/// implementations build a [`crate::consumer::Consumer`] and block inside
/// `receive`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Worker: Send + Sync {
    /// Name of the worker type; also names the pid-lock directory.
    fn name(&self) -> &str;

    /// How many processes of this worker may run concurrently.
    fn parallelism(&self) -> usize {
        1
    }

    /// The worker body. Expected to observe the shutdown token and drain.
    async fn run(&self, shutdown: Shutdown) -> Result<(), WorkerError>;
}

/// Static map from worker-type name to worker instance.
///
/// Populated once at startup; there is no runtime discovery of worker
/// types.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry::default()
    }

    /// Adds a worker type. A later registration under the same name
    /// replaces the earlier one.
    pub fn register(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(worker.name().to_owned(), worker);
        self
    }

    /// Looks a worker type up by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Worker>, WorkerError> {
        self.workers
            .get(name)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownWorker(name.to_owned()))
    }

    /// Iterates over every registered worker type.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Worker>> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
