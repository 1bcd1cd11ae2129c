//! Worker registration: handlers, per-type execution settings, and the
//! catalogue assembled at process startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::job::{ExecResult, Job, RetryPolicy};

/// Handler for one worker type.
///
/// Implementations must be safe to call concurrently: a pool runs up to
/// `concurrency` executions of the same handler at once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> ExecResult;
}

/// What `push_job` does when a bounded queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueFullPolicy {
    /// Fail the submission with `QueueFull`. The caller must retry or drop.
    #[default]
    Reject,
    /// Await until capacity frees up.
    Block,
}

/// Execution settings for one worker type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent execution slots.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Bounded queue depth in front of the slots.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub full_policy: QueueFullPolicy,
    /// Default execution deadline, overridable per submission.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            full_policy: QueueFullPolicy::default(),
            timeout: default_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_full_policy(mut self, policy: QueueFullPolicy) -> Self {
        self.full_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(300))
}

/// One worker type: name, settings, handler.
#[derive(Clone)]
pub struct WorkerDef {
    pub name: String,
    pub config: WorkerConfig,
    pub handler: Arc<dyn JobHandler>,
}

/// The worker catalogue handed to `Broker::start`, assembled once at
/// process startup.
#[derive(Default, Clone)]
pub struct WorkersList {
    defs: Vec<WorkerDef>,
}

impl WorkersList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker type. A later registration with the same name
    /// replaces the earlier one.
    pub fn register(
        mut self,
        name: impl Into<String>,
        config: WorkerConfig,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let name = name.into();
        self.defs.retain(|def| def.name != name);
        self.defs.push(WorkerDef {
            name,
            config,
            handler,
        });
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.defs.iter().any(|def| def.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerDef> {
        self.defs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerDef> {
        self.defs.iter_mut()
    }
}

impl IntoIterator for WorkersList {
    type Item = WorkerDef;
    type IntoIter = std::vec::IntoIter<WorkerDef>;

    fn into_iter(self) -> Self::IntoIter {
        self.defs.into_iter()
    }
}
