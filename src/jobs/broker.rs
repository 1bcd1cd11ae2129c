//! The broker contract: one queueing abstraction, two backends.
//!
//! Callers are backend-agnostic. The in-process broker keeps everything in
//! memory inside one process; the Redis broker shares per-type lists across
//! every server process connected to the same instance.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::Result;

use super::handler::WorkersList;
use super::job::{Job, JobEvent, JobId};

/// A job submission.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub worker_type: String,
    pub payload: serde_json::Value,
    /// Set when a trigger fire created this submission.
    pub trigger_id: Option<String>,
    /// Execution deadline overriding the worker type's default.
    pub timeout: Option<Duration>,
}

impl JobRequest {
    pub fn new(worker_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            worker_type: worker_type.into(),
            payload,
            trigger_id: None,
            timeout: None,
        }
    }

    pub fn with_trigger(mut self, trigger_id: impl Into<String>) -> Self {
        self.trigger_id = Some(trigger_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the job record for this submission.
    pub(crate) fn into_job(self) -> Job {
        let mut job = Job::new(self.worker_type, self.payload);
        job.trigger_id = self.trigger_id;
        job.timeout = self.timeout;
        job
    }
}

/// Queues jobs and dispatches them to worker pools.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Register the worker catalogue and start one pool per type. Calling
    /// `start` on a running broker is an error.
    async fn start(&self, workers: WorkersList) -> Result<()>;

    /// Enqueue a job and return immediately with its id. Fails with
    /// `UnknownWorkerType` when no pool is registered for the type, and
    /// with `QueueFull` under the reject backpressure policy.
    async fn push_job(&self, request: JobRequest) -> Result<JobId>;

    /// Approximate queue depth for one worker type, for observability and
    /// upstream backpressure decisions.
    async fn queue_len(&self, worker_type: &str) -> Result<usize>;

    /// Subscribe to job completion events (success/failure, duration,
    /// attempts).
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;

    /// Stop accepting submissions and drain the pools.
    async fn shutdown(&self);
}
