//! Bounded worker pool for one worker type.
//!
//! Each pool owns a FIFO queue and `concurrency` execution slots. Slots pull
//! the next queued job, run the handler under the job's deadline, apply the
//! retry policy in place, and emit a completion event. A panicking or
//! failing job never takes a slot down.

use metrics::{counter, histogram};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::handler::{JobHandler, QueueFullPolicy, WorkerConfig, WorkerDef};
use super::job::{ExecError, ExecResult, Job, JobEvent, JobState};

/// A running pool for one worker type.
pub(crate) struct WorkerPool {
    name: String,
    config: WorkerConfig,
    queue: mpsc::Sender<Job>,
    depth: Arc<AtomicI64>,
    slots: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn the execution slots and return the live pool.
    pub(crate) fn start(
        def: WorkerDef,
        events: broadcast::Sender<JobEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let WorkerDef {
            name,
            config,
            handler,
        } = def;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let depth = Arc::new(AtomicI64::new(0));

        let concurrency = config.concurrency.max(1);
        let mut slots = Vec::with_capacity(concurrency);
        for slot in 0..concurrency {
            slots.push(tokio::spawn(run_slot(
                slot,
                name.clone(),
                config.clone(),
                handler.clone(),
                rx.clone(),
                depth.clone(),
                events.clone(),
                cancel.clone(),
            )));
        }

        info!(
            worker_type = %name,
            concurrency,
            queue_capacity = config.queue_capacity,
            "worker pool started"
        );

        Self {
            name,
            config,
            queue: tx,
            depth,
            slots: parking_lot::Mutex::new(slots),
            cancel,
        }
    }

    /// Enqueue a job, honoring the configured queue-full policy. Never
    /// silently drops: a rejected job surfaces as `QueueFull`.
    pub(crate) async fn submit(&self, job: Job) -> Result<()> {
        match self.config.full_policy {
            QueueFullPolicy::Reject => self
                .queue
                .try_send(job)
                .map_err(|_| Error::QueueFull(self.name.clone()))?,
            QueueFullPolicy::Block => self
                .queue
                .send(job)
                .await
                .map_err(|_| Error::QueueFull(self.name.clone()))?,
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue awaiting capacity regardless of policy. Used by the
    /// distributed fetcher, which has already claimed the job and must not
    /// drop it on local backpressure.
    pub(crate) async fn feed(&self, job: Job) -> Result<()> {
        self.queue
            .send(job)
            .await
            .map_err(|_| Error::QueueFull(self.name.clone()))?;
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Approximate number of jobs waiting on the queue.
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed).max(0) as usize
    }

    /// Stop accepting work and wait for the slots to finish their current
    /// job.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        let slots: Vec<_> = self.slots.lock().drain(..).collect();
        for slot in slots {
            let _ = slot.await;
        }
        debug!(worker_type = %self.name, "worker pool closed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_slot(
    slot: usize,
    name: String,
    config: WorkerConfig,
    handler: Arc<dyn JobHandler>,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    depth: Arc<AtomicI64>,
    events: broadcast::Sender<JobEvent>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = tokio::select! {
                _ = cancel.cancelled() => break,
                guard = queue.lock() => guard,
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            }
        };
        depth.fetch_sub(1, Ordering::Relaxed);
        execute(slot, &name, &config, &handler, &events, job).await;
    }
    debug!(worker_type = %name, slot, "execution slot stopped");
}

/// Run one job to a terminal state, retrying transient failures in place.
async fn execute(
    slot: usize,
    name: &str,
    config: &WorkerConfig,
    handler: &Arc<dyn JobHandler>,
    events: &broadcast::Sender<JobEvent>,
    mut job: Job,
) {
    let started = Instant::now();
    job.mark_running();

    loop {
        job.attempts += 1;
        debug!(
            job_id = %job.id,
            worker_type = %name,
            slot,
            attempt = job.attempts,
            "executing job"
        );

        match run_attempt(handler, &job, config).await {
            Ok(output) => {
                job.mark_done(output);
                break;
            }
            Err(err) => {
                if config.retry.should_retry(job.attempts, &err) {
                    let delay = config.retry.backoff.delay_for_attempt(job.attempts - 1);
                    warn!(
                        job_id = %job.id,
                        worker_type = %name,
                        attempt = job.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    counter!("cumulus_job_retries_total", "worker_type" => name.to_string())
                        .increment(1);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                job.mark_errored(err.message.clone());
                break;
            }
        }
    }

    let duration = started.elapsed();
    counter!("cumulus_jobs_total", "worker_type" => name.to_string()).increment(1);
    histogram!("cumulus_job_duration_seconds", "worker_type" => name.to_string())
        .record(duration.as_secs_f64());

    match job.state {
        JobState::Done => {
            info!(
                job_id = %job.id,
                worker_type = %name,
                attempts = job.attempts,
                duration_ms = duration.as_millis() as u64,
                "job done"
            );
        }
        JobState::Errored => {
            counter!("cumulus_jobs_failed", "worker_type" => name.to_string()).increment(1);
            error!(
                job_id = %job.id,
                worker_type = %name,
                attempts = job.attempts,
                error = job.last_error.as_deref().unwrap_or("unknown"),
                "job errored"
            );
        }
        // Unreachable: the loop above only exits on a terminal state.
        _ => {}
    }

    let _ = events.send(JobEvent {
        job_id: job.id,
        worker_type: name.to_string(),
        state: job.state,
        attempts: job.attempts,
        duration,
        error: job.last_error.clone(),
        output: job.output.clone(),
    });
}

/// Run a single attempt on its own task so a panicking handler cannot take
/// the slot down, enforcing the job deadline if one is set.
async fn run_attempt(
    handler: &Arc<dyn JobHandler>,
    job: &Job,
    config: &WorkerConfig,
) -> ExecResult {
    let handler = handler.clone();
    let snapshot = job.clone();
    let mut task = tokio::spawn(async move { handler.handle(&snapshot).await });

    let joined = match job.timeout.or(config.timeout) {
        Some(deadline) => match tokio::time::timeout(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(ExecError::transient(format!(
                    "execution deadline of {deadline:?} exceeded"
                )));
            }
        },
        None => (&mut task).await,
    };

    match joined {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(ExecError::permanent("handler panicked")),
        Err(_) => Err(ExecError::permanent("handler task cancelled")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    use crate::jobs::job::{BackoffStrategy, RetryPolicy};

    fn pool_with(
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> (WorkerPool, broadcast::Receiver<JobEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let def = WorkerDef {
            name: "test".to_string(),
            config,
            handler,
        };
        let pool = WorkerPool::start(def, tx, CancellationToken::new());
        (pool, rx)
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffStrategy::Fixed { delay_secs: 0 },
        }
    }

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: &Job) -> ExecResult {
            Ok(Some(job.payload.clone()))
        }
    }

    #[tokio::test]
    async fn test_echo_job_reaches_done_with_output() {
        let (pool, mut rx) = pool_with(Arc::new(Echo), WorkerConfig::default());

        pool.submit(Job::new("test", json!("hello"))).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.state, JobState::Done);
        assert_eq!(event.attempts, 1);
        assert_eq!(event.output, Some(json!("hello")));

        pool.close().await;
    }

    struct FlakyThenOk {
        failures: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for FlakyThenOk {
        async fn handle(&self, _job: &Job) -> ExecResult {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(ExecError::transient("connection reset"))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let handler = Arc::new(FlakyThenOk {
            failures: AtomicU32::new(2),
        });
        let config = WorkerConfig::default().with_retry(fast_retry(5));
        let (pool, mut rx) = pool_with(handler, config);

        pool.submit(Job::new("test", json!(null))).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.state, JobState::Done);
        // Two failures plus the successful attempt.
        assert_eq!(event.attempts, 3);

        pool.close().await;
    }

    struct AlwaysTransient;

    #[async_trait]
    impl JobHandler for AlwaysTransient {
        async fn handle(&self, _job: &Job) -> ExecResult {
            Err(ExecError::transient("still down"))
        }
    }

    #[tokio::test]
    async fn test_transient_exhausts_attempts_then_errors() {
        let config = WorkerConfig::default().with_retry(fast_retry(3));
        let (pool, mut rx) = pool_with(Arc::new(AlwaysTransient), config);

        pool.submit(Job::new("test", json!(null))).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.state, JobState::Errored);
        assert_eq!(event.attempts, 3);
        assert_eq!(event.error.as_deref(), Some("still down"));

        pool.close().await;
    }

    struct Permanent;

    #[async_trait]
    impl JobHandler for Permanent {
        async fn handle(&self, _job: &Job) -> ExecResult {
            Err(ExecError::permanent("malformed payload"))
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retry() {
        let config = WorkerConfig::default().with_retry(fast_retry(5));
        let (pool, mut rx) = pool_with(Arc::new(Permanent), config);

        pool.submit(Job::new("test", json!(null))).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.state, JobState::Errored);
        assert_eq!(event.attempts, 1);

        pool.close().await;
    }

    struct Panicky;

    #[async_trait]
    impl JobHandler for Panicky {
        async fn handle(&self, job: &Job) -> ExecResult {
            if job.payload == json!("boom") {
                panic!("handler exploded");
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_the_pool() {
        let config = WorkerConfig::default()
            .with_concurrency(1)
            .with_retry(RetryPolicy::no_retry());
        let (pool, mut rx) = pool_with(Arc::new(Panicky), config);

        pool.submit(Job::new("test", json!("boom"))).await.unwrap();
        pool.submit(Job::new("test", json!("fine"))).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.state, JobState::Errored);
        assert_eq!(first.error.as_deref(), Some("handler panicked"));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.state, JobState::Done);

        pool.close().await;
    }

    struct Sleeper;

    #[async_trait]
    impl JobHandler for Sleeper {
        async fn handle(&self, _job: &Job) -> ExecResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_errors_the_job() {
        let config = WorkerConfig::default()
            .with_timeout(Duration::from_millis(100))
            .with_retry(RetryPolicy::no_retry());
        let (pool, mut rx) = pool_with(Arc::new(Sleeper), config);

        pool.submit(Job::new("test", json!(null))).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.state, JobState::Errored);
        assert!(event.error.unwrap().contains("deadline"));

        pool.close().await;
    }

    struct Recorder {
        seen: parking_lot::Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: &Job) -> ExecResult {
            self.seen.lock().push(job.payload.clone());
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_fifo_within_worker_type() {
        let handler = Arc::new(Recorder {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let config = WorkerConfig::default().with_concurrency(1);
        let (pool, mut rx) = pool_with(handler.clone(), config);

        for i in 0..5 {
            pool.submit(Job::new("test", json!(i))).await.unwrap();
        }
        for _ in 0..5 {
            rx.recv().await.unwrap();
        }

        let seen = handler.seen.lock().clone();
        assert_eq!(seen, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);

        pool.close().await;
    }

    struct Gated {
        started: tokio::sync::mpsc::UnboundedSender<()>,
        release: Arc<Semaphore>,
    }

    #[async_trait]
    impl JobHandler for Gated {
        async fn handle(&self, _job: &Job) -> ExecResult {
            let _ = self.started.send(());
            self.release.acquire().await.unwrap().forget();
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_queue_full_rejects_without_dropping_queued_jobs() {
        let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        let handler = Arc::new(Gated {
            started: started_tx,
            release: release.clone(),
        });
        let config = WorkerConfig::default()
            .with_concurrency(1)
            .with_queue_capacity(1);
        let (pool, mut rx) = pool_with(handler, config);

        // First job occupies the slot, second fills the queue.
        pool.submit(Job::new("test", json!(1))).await.unwrap();
        started_rx.recv().await.unwrap();
        pool.submit(Job::new("test", json!(2))).await.unwrap();

        let overflow = pool.submit(Job::new("test", json!(3))).await;
        assert!(matches!(overflow, Err(Error::QueueFull(_))));

        // The queued jobs are unaffected by the rejection.
        release.add_permits(2);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.state, JobState::Done);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.state, JobState::Done);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_depth_tracks_queued_jobs() {
        let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        let handler = Arc::new(Gated {
            started: started_tx,
            release: release.clone(),
        });
        let config = WorkerConfig::default()
            .with_concurrency(1)
            .with_queue_capacity(8);
        let (pool, mut rx) = pool_with(handler, config);

        pool.submit(Job::new("test", json!(1))).await.unwrap();
        started_rx.recv().await.unwrap();
        pool.submit(Job::new("test", json!(2))).await.unwrap();
        pool.submit(Job::new("test", json!(3))).await.unwrap();
        assert_eq!(pool.depth(), 2);

        release.add_permits(3);
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        assert_eq!(pool.depth(), 0);

        pool.close().await;
    }
}
