//! # Cumulus Core
//!
//! The job processing core of the Cumulus personal-cloud server.
//!
//! ## Architecture
//!
//! - **Jobs**: immutable units of work with a monotonic lifecycle
//! - **Worker pools**: bounded concurrent execution with retry, deadlines
//!   and panic isolation
//! - **Broker**: the queueing contract, in-process or Redis-backed
//! - **Triggers**: persisted cron/at/every/event rules
//! - **Scheduler**: timer-heap or fleet-safe sorted-set fire loops
//! - **JobSystem**: one-shot bootstrap selecting the backend pair
//!
//! The HTTP, OAuth and document-store surfaces of the full server are
//! external collaborators; they reach the job core through the
//! [`system::JobSystem`] context and the [`scheduler::TriggerStore`] seam.

pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod scheduler;
pub mod system;
pub mod telemetry;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BackendKind, Config};
    pub use crate::error::{Error, Result};
    pub use crate::events::{DomainEvent, EventBus, EventVerb};
    pub use crate::jobs::{
        BackoffStrategy, Broker, ExecError, ExecResult, Job, JobEvent, JobHandler, JobId,
        JobRequest, JobState, MemBroker, QueueFullPolicy, RedisBroker, RetryPolicy, WorkerConfig,
        WorkersList,
    };
    pub use crate::scheduler::{
        EventFilter, MemScheduler, MemTriggerStore, RedisScheduler, Scheduler, Trigger,
        TriggerKind, TriggerStore,
    };
    pub use crate::system::JobSystem;
}
