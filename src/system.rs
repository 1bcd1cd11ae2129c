//! Process bootstrap for the job system.
//!
//! [`JobSystem::start`] selects the in-memory or Redis-backed
//! broker/scheduler pair from configuration, starts both, and hands back an
//! explicit context object. Construct it once at process start and pass it
//! to every component that submits jobs; there is no global handle to
//! access out of order, and any bootstrap failure aborts startup.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{BackendKind, Config};
use crate::error::Result;
use crate::events::EventBus;
use crate::jobs::{Broker, JobId, JobRequest, MemBroker, RedisBroker, WorkersList};
use crate::scheduler::{MemScheduler, MemTriggerStore, RedisScheduler, Scheduler, TriggerStore};

/// The running job system: broker, scheduler and the domain event feed.
pub struct JobSystem {
    broker: Arc<dyn Broker>,
    scheduler: Arc<dyn Scheduler>,
    events: EventBus,
}

impl JobSystem {
    /// Start with an in-memory trigger store. Single-instance deployments
    /// and the dev binary use this; the full server injects its document
    /// store through [`JobSystem::start_with_store`].
    pub async fn start(config: &Config, workers: WorkersList) -> Result<Self> {
        Self::start_with_store(config, workers, Arc::new(MemTriggerStore::new())).await
    }

    pub async fn start_with_store(
        config: &Config,
        mut workers: WorkersList,
        store: Arc<dyn TriggerStore>,
    ) -> Result<Self> {
        config.jobs.apply_overrides(&mut workers);
        let events = EventBus::default();

        let (broker, scheduler): (Arc<dyn Broker>, Arc<dyn Scheduler>) = match config.jobs.backend
        {
            BackendKind::Memory => (
                Arc::new(MemBroker::new()),
                Arc::new(MemScheduler::new(store, events.clone())),
            ),
            BackendKind::Redis => {
                let client = redis::Client::open(config.jobs.redis.url.as_str())?;
                (
                    Arc::new(RedisBroker::new(client.clone())),
                    Arc::new(
                        RedisScheduler::new(client, store, events.clone())
                            .with_tick(Duration::from_millis(config.jobs.tick_interval_ms)),
                    ),
                )
            }
        };

        broker.start(workers).await?;
        scheduler.start(broker.clone()).await?;

        info!(backend = ?config.jobs.backend, "job system started");
        Ok(Self {
            broker,
            scheduler,
            events,
        })
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// The domain event feed consumed by event triggers. The server's
    /// document layer publishes into it.
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Submit a job directly, outside any trigger.
    pub async fn push_job(&self, worker_type: &str, payload: serde_json::Value) -> Result<JobId> {
        self.broker
            .push_job(JobRequest::new(worker_type, payload))
            .await
    }

    /// Stop the scheduler loops, then drain the worker pools.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.broker.shutdown().await;
        info!("job system stopped");
    }
}
