//! Worker-pool executor for the ADC platform.
//!
//! Distributed modules register their methods in a [`MethodRegistry`]
//! (built at registration time — no runtime reflection) and call through
//! a [`WorkerProxy`]: bound to a [`WorkerPool`], invocations run on
//! single-task workers picked by load; unbound, they run in-process.
//! The pool sizes itself between `min_workers` and
//! `max(2, cpu_count - 1)` from sampled utilization.

pub mod pool;
pub mod registry;

pub use pool::{
    default_max_workers, PoolConfig, WorkerBackend, WorkerInfo, WorkerPool, WorkerProxy,
};
pub use registry::MethodRegistry;

use std::fmt;

/// Errors raised by method dispatch.
#[derive(Debug)]
pub enum ExecutorError {
    /// The method is not in the registry.
    UnknownMethod(String),
    /// The per-call deadline elapsed; the worker is marked suspect.
    Timeout { method: String },
    /// The worker's channel closed before a reply arrived.
    WorkerGone,
    /// The pool has no workers.
    NoWorkers,
    /// The handler itself failed.
    Invocation(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::UnknownMethod(name) => write!(f, "Unknown method '{name}'"),
            ExecutorError::Timeout { method } => {
                write!(f, "Dispatch of '{method}' exceeded the call deadline")
            }
            ExecutorError::WorkerGone => write!(f, "Worker terminated before replying"),
            ExecutorError::NoWorkers => write!(f, "No workers available"),
            ExecutorError::Invocation(msg) => write!(f, "Invocation failed: {msg}"),
        }
    }
}

impl std::error::Error for ExecutorError {}
