// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Workers
//!
//! RabbitMQ messaging for long-running worker processes, built on
//! [`lapin`]. The crate covers four concerns:
//!
//! - a named [`registry::ConnectionRegistry`] of AMQP connections and
//!   their channels,
//! - declarative topology provisioning through
//!   [`topology::TopologyBuilder`], including a dead-letter companion
//!   queue per primary queue,
//! - the data path: [`publisher::Publisher`] for persistent publishes and
//!   [`consumer::Consumer`] for manual-ack delivery loops with graceful
//!   drain,
//! - out-of-process [`supervisor::WorkerSupervisor`] orchestration, where
//!   each worker slot is guarded by an advisory pid-file lock.

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod topology;
pub mod worker;

#[cfg(unix)]
pub mod lock;
#[cfg(unix)]
pub mod supervisor;
