//! In-process broker backend.
//!
//! One bounded in-memory queue per worker type, feeding that type's pool
//! directly. No cross-process visibility; all queued state is lost when the
//! process exits.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::broker::{Broker, JobRequest};
use super::handler::WorkersList;
use super::job::{JobEvent, JobId};
use super::pool::WorkerPool;

pub struct MemBroker {
    pools: DashMap<String, Arc<WorkerPool>>,
    events: broadcast::Sender<JobEvent>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl MemBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            pools: DashMap::new(),
            events,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn ensure_started(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }
}

impl Default for MemBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemBroker {
    async fn start(&self, workers: WorkersList) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        for def in workers {
            let name = def.name.clone();
            let pool = WorkerPool::start(def, self.events.clone(), self.cancel.child_token());
            self.pools.insert(name, Arc::new(pool));
        }
        Ok(())
    }

    async fn push_job(&self, request: JobRequest) -> Result<JobId> {
        self.ensure_started()?;
        let pool = self
            .pools
            .get(&request.worker_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownWorkerType(request.worker_type.clone()))?;

        let job = request.into_job();
        let id = job.id;
        pool.submit(job).await?;
        Ok(id)
    }

    async fn queue_len(&self, worker_type: &str) -> Result<usize> {
        self.ensure_started()?;
        self.pools
            .get(worker_type)
            .map(|entry| entry.value().depth())
            .ok_or_else(|| Error::UnknownWorkerType(worker_type.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let pools: Vec<Arc<WorkerPool>> = self
            .pools
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        futures::future::join_all(pools.iter().map(|pool| pool.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::builtin::EchoHandler;
    use crate::jobs::handler::WorkerConfig;
    use crate::jobs::job::JobState;
    use serde_json::json;

    fn echo_workers() -> WorkersList {
        WorkersList::new().register("echo", WorkerConfig::default(), Arc::new(EchoHandler))
    }

    #[tokio::test]
    async fn test_push_before_start_fails() {
        let broker = MemBroker::new();
        let err = broker
            .push_job(JobRequest::new("echo", json!("hello")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let broker = MemBroker::new();
        broker.start(echo_workers()).await.unwrap();
        let err = broker.start(echo_workers()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_worker_type() {
        let broker = MemBroker::new();
        broker.start(echo_workers()).await.unwrap();
        let err = broker
            .push_job(JobRequest::new("thumbnails", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownWorkerType(_)));
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_push_and_complete() {
        let broker = MemBroker::new();
        let mut events = broker.subscribe();
        broker.start(echo_workers()).await.unwrap();

        let id = broker
            .push_job(JobRequest::new("echo", json!("hello")))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, id);
        assert_eq!(event.state, JobState::Done);
        assert_eq!(event.output, Some(json!("hello")));

        assert_eq!(broker.queue_len("echo").await.unwrap(), 0);
        broker.shutdown().await;
    }
}
