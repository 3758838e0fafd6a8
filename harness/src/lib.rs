//! Verify collator rotation, container chain lifecycle, and node-local side effects.
//!
//! # Overview
//!
//! An orchestrator chain assigns collators (workers) to container chains (tenants) once per
//! epoch. This crate provides the primitives a scenario uses to observe the effects of that
//! assignment from the outside:
//!
//! - [epoch::Waiter] polls the orchestrator until a target epoch is reached (or a predicate
//!   holds) and then waits a grace period of blocks.
//! - [assignment::Snapshot] is a validated view of which workers serve which tenants in an epoch,
//!   cross-checked against the authority list each tenant reports locally.
//! - [logs] scans a node's log for an ordered sequence of milestones (or for lines that must
//!   never appear).
//! - [state] asserts that per-tenant database directories exist exactly when they should.
//! - [process] locates worker processes and restarts them out-of-band for fault injection.
//! - [authors] fans out block author queries with bounded concurrency.
//!
//! The chain itself is reached only through the [chain::Chain] and [chain::Blocks] traits.
//! Every component takes a [Config] at construction, so a suite never reads the environment
//! more than once.
//!
//! # Status
//!
//! All components assume suites run sequentially against a given network: no two suites inject
//! faults into the same worker at the same time.

use std::path::PathBuf;
use thiserror::Error;

pub mod assignment;
pub mod authors;
pub mod chain;
mod config;
pub use config::{Config, NETWORK_DIR_ENV};
pub mod epoch;
pub mod logs;
pub mod process;
pub mod state;

#[cfg(test)]
pub mod mocks;

pub use chain::{Epoch, PublicId, TenantId};

/// Errors that can occur while verifying a network.
#[derive(Error, Debug)]
pub enum Error {
    #[error("timeout waiting for epoch {target} (last observed: {last})")]
    Timeout { target: Epoch, last: Epoch },
    #[error("consistency violation for tenant {tenant}: orchestrator={orchestrator:?} local={local:?}")]
    ConsistencyViolation {
        tenant: TenantId,
        orchestrator: Vec<PublicId>,
        local: Vec<PublicId>,
    },
    #[error("worker {worker} assigned to both {first} and {second}")]
    DuplicateAssignment {
        worker: PublicId,
        first: String,
        second: String,
    },
    #[error("tenant {tenant} has {actual} workers (expected {expected})")]
    WorkerCount {
        tenant: TenantId,
        expected: usize,
        actual: usize,
    },
    #[error("assignment mismatch in epoch {epoch}: {diff}")]
    AssignmentMismatch { epoch: Epoch, diff: String },
    #[error("worker {worker} not assigned to the orchestrator in epoch {epoch}")]
    NotOrchestrator { epoch: Epoch, worker: PublicId },
    #[error("unknown worker: {0}")]
    UnknownWorker(PublicId),
    #[error("log sequence incomplete in {path:?}: missing '{missing}'\ncontext around the last found log:\n{context}")]
    LogSequenceIncomplete {
        path: PathBuf,
        missing: String,
        context: String,
    },
    #[error("forbidden log '{log}' found in {path:?}\ncontext around the found log:\n{context}")]
    ForbiddenLogFound {
        path: PathBuf,
        log: String,
        context: String,
    },
    #[error("log {path:?} did not grow past {size} bytes")]
    LogsStalled { path: PathBuf, size: u64 },
    #[error("directory {path:?} existence mismatch (expected exists={expected})")]
    DirectoryStateMismatch { path: PathBuf, expected: bool },
    #[error("stale state for worker {worker} and tenant {tenant}: {path:?}")]
    StaleState {
        worker: String,
        tenant: TenantId,
        path: PathBuf,
    },
    #[error("process not found: {0}")]
    ProcessNotFound(String),
    #[error("multiple processes match {pattern}: {processes:?}")]
    AmbiguousProcess {
        pattern: String,
        processes: Vec<String>,
    },
    #[error("signal {signal} to {pid} failed: {error}")]
    SignalFailed {
        pid: u32,
        signal: i32,
        error: std::io::Error,
    },
    #[error("authority set changed within range: {sessions:?}")]
    AuthoritySetChanged { sessions: Vec<Epoch> },
    #[error("unexpected authors: expected {expected}, actual {actual:?} (blocks {blocks:?})")]
    UnexpectedAuthors {
        expected: usize,
        actual: Vec<PublicId>,
        blocks: Vec<u64>,
    },
    #[error("invalid range: {start}..={end}")]
    InvalidRange { start: u64, end: u64 },
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
