//! Job queueing and execution.
//!
//! This module provides the job half of the Cumulus job system:
//!
//! - **Job**: an immutable unit of work with a monotonic lifecycle
//! - **Handlers**: the worker catalogue mapping type names to handlers
//! - **Worker pools**: bounded concurrent execution with retry and deadlines
//! - **Broker**: the queueing contract, with in-process and Redis backends
//!
//! ```text
//! push_job ──▶ Broker ──▶ per-type queue ──▶ WorkerPool slot ──▶ handler
//!                │                                   │
//!                └──────────── completion events ◀───┘
//! ```

pub mod broker;
pub mod builtin;
pub mod handler;
pub mod job;
pub mod mem;
pub(crate) mod pool;
pub mod redis;

pub use broker::{Broker, JobRequest};
pub use handler::{JobHandler, QueueFullPolicy, WorkerConfig, WorkerDef, WorkersList};
pub use job::{
    BackoffStrategy, ExecError, ExecResult, Job, JobEvent, JobId, JobState, RetryPolicy,
};
pub use mem::MemBroker;
pub use redis::RedisBroker;
