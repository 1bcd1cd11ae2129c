//! Redis-backed broker backend.
//!
//! Jobs are serialized onto one Redis list per worker type. Every server
//! process holding a connection runs its own pools and blocking-pops from
//! the same lists, so work is load-balanced across the fleet. A push also
//! publishes a notification so idle consumers wake immediately.
//!
//! Delivery is at-most-once-per-claim: a `BLPOP` removes the entry from the
//! list, so a process that crashes between claiming and completing loses
//! that job. There is no visibility-timeout or requeue-on-crash scheme.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{Error, Result};

use super::broker::{Broker, JobRequest};
use super::handler::WorkersList;
use super::job::{Job, JobEvent, JobId};
use super::pool::WorkerPool;

const DEFAULT_PREFIX: &str = "cumulus";

pub struct RedisBroker {
    client: redis::Client,
    prefix: String,
    pools: DashMap<String, Arc<WorkerPool>>,
    fetchers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<JobEvent>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl RedisBroker {
    pub fn new(client: redis::Client) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            pools: DashMap::new(),
            fetchers: parking_lot::Mutex::new(Vec::new()),
            events,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Namespace all keys under a different prefix. Lets several job systems
    /// share one Redis instance.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn queue_key(&self, worker_type: &str) -> String {
        format!("{}:jobs:queue:{}", self.prefix, worker_type)
    }

    fn notify_key(&self, worker_type: &str) -> String {
        format!("{}:jobs:notify:{}", self.prefix, worker_type)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn ensure_started(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn start(&self, workers: WorkersList) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let mut fetchers = self.fetchers.lock();
        for def in workers {
            let name = def.name.clone();
            let pool = Arc::new(WorkerPool::start(
                def,
                self.events.clone(),
                self.cancel.child_token(),
            ));
            fetchers.push(tokio::spawn(fetch_loop(
                self.client.clone(),
                self.queue_key(&name),
                pool.clone(),
                self.cancel.child_token(),
            )));
            self.pools.insert(name, pool);
        }
        Ok(())
    }

    async fn push_job(&self, request: JobRequest) -> Result<JobId> {
        self.ensure_started()?;
        if !self.pools.contains_key(&request.worker_type) {
            return Err(Error::UnknownWorkerType(request.worker_type.clone()));
        }

        let worker_type = request.worker_type.clone();
        let job = request.into_job();
        let id = job.id;
        let raw = serde_json::to_string(&job)?;

        let mut conn = self.get_conn().await?;
        redis::cmd("RPUSH")
            .arg(self.queue_key(&worker_type))
            .arg(&raw)
            .query_async::<_, i64>(&mut conn)
            .await?;
        // Wake idle consumers; BLPOP waiters do not need it but pools that
        // poll with a plain pop do.
        redis::cmd("PUBLISH")
            .arg(self.notify_key(&worker_type))
            .arg(id.to_string())
            .query_async::<_, i64>(&mut conn)
            .await?;

        Ok(id)
    }

    async fn queue_len(&self, worker_type: &str) -> Result<usize> {
        self.ensure_started()?;
        if !self.pools.contains_key(worker_type) {
            return Err(Error::UnknownWorkerType(worker_type.to_string()));
        }
        let mut conn = self.get_conn().await?;
        let len: usize = redis::cmd("LLEN")
            .arg(self.queue_key(worker_type))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let fetchers: Vec<_> = self.fetchers.lock().drain(..).collect();
        futures::future::join_all(fetchers).await;
        let pools: Vec<Arc<WorkerPool>> = self
            .pools
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        futures::future::join_all(pools.iter().map(|pool| pool.close())).await;
    }
}

/// Claim jobs off the shared list and feed them to the local pool. Runs on
/// a dedicated connection because `BLPOP` parks it server-side.
async fn fetch_loop(
    client: redis::Client,
    queue_key: String,
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
) {
    'reconnect: while !cancel.is_cancelled() {
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(queue = %queue_key, error = %err, "redis connection failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue 'reconnect,
                }
            }
        };

        loop {
            let mut blpop_cmd = redis::cmd("BLPOP");
            blpop_cmd.arg(&queue_key).arg(1_usize);
            let popped: std::result::Result<Option<(String, String)>, redis::RedisError> = tokio::select! {
                _ = cancel.cancelled() => return,
                res = blpop_cmd.query_async(&mut conn) => res,
            };

            match popped {
                Ok(Some((_key, raw))) => match serde_json::from_str::<Job>(&raw) {
                    Ok(job) => {
                        if pool.feed(job).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        error!(queue = %queue_key, error = %err, "discarding undecodable job");
                    }
                },
                // Timed out with nothing due; loop around to re-check cancel.
                Ok(None) => {}
                Err(err) => {
                    warn!(queue = %queue_key, error = %err, "blocking pop failed, reconnecting");
                    continue 'reconnect;
                }
            }
        }
    }
}
