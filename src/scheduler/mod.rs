//! Trigger evaluation and automatic job submission.
//!
//! The scheduler loads persisted triggers, computes next-fire times (or
//! listens for matching domain events), and submits a job to the broker on
//! every fire. Like the broker it comes in two flavors behind one trait:
//! a timer-driven in-memory scheduler for single-instance deployments, and
//! a Redis-backed scheduler safe to run on every process of a fleet.

pub mod mem;
pub mod redis;
pub mod storage;
pub mod trigger;

pub use mem::MemScheduler;
pub use redis::RedisScheduler;
pub use storage::{MemTriggerStore, TriggerStore};
pub use trigger::{EventFilter, Trigger, TriggerKind};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::events::EventBus;
use crate::jobs::Broker;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Load all persisted triggers, compute their due times and begin the
    /// fire loop, submitting jobs to `broker`. Starting twice is an error.
    async fn start(&self, broker: Arc<dyn Broker>) -> Result<()>;

    /// Persist a new trigger and schedule it immediately, no restart
    /// required.
    async fn add(&self, trigger: Trigger) -> Result<()>;

    /// Cancel pending fires and delete the trigger. Fails with `NotFound`
    /// for an unknown id. An already-dispatched job is never cancelled.
    async fn remove(&self, trigger_id: &str) -> Result<()>;

    /// Snapshot of all persisted triggers, for introspection and listing.
    async fn get_all(&self) -> Result<Vec<Trigger>>;

    /// Stop the fire loops. Triggers stay persisted.
    async fn shutdown(&self);
}

/// Event triggers currently registered with a running scheduler instance.
pub(crate) type EventTriggerRegistry = Arc<RwLock<HashMap<String, Trigger>>>;

/// Submit the job for one fire of `trigger`, retiring one-shot triggers.
/// Fire errors are logged, never propagated: a failing submission must not
/// stop the loop or affect other triggers.
pub(crate) async fn fire(
    broker: &Arc<dyn Broker>,
    store: &Arc<dyn TriggerStore>,
    trigger: &Trigger,
) {
    counter!("cumulus_trigger_fires_total", "worker_type" => trigger.worker.clone()).increment(1);
    match broker.push_job(trigger.to_request()).await {
        Ok(job_id) => {
            info!(
                trigger_id = %trigger.id,
                worker_type = %trigger.worker,
                %job_id,
                "trigger fired"
            );
        }
        Err(err) => {
            error!(
                trigger_id = %trigger.id,
                worker_type = %trigger.worker,
                error = %err,
                "trigger fire failed to submit job"
            );
        }
    }
    if trigger.is_one_shot() {
        if let Err(err) = store.delete(&trigger.id).await {
            error!(trigger_id = %trigger.id, error = %err, "failed to retire one-shot trigger");
        }
    }
}

/// Listen on the domain event feed and fire matching event triggers,
/// bypassing the timer path. Debounced triggers coalesce a burst into a
/// single fire after the quiet period.
pub(crate) async fn run_event_loop(
    bus: EventBus,
    registry: EventTriggerRegistry,
    broker: Arc<dyn Broker>,
    store: Arc<dyn TriggerStore>,
    cancel: CancellationToken,
) {
    let mut rx = bus.subscribe();
    let debouncing: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event feed lagged, triggers may have missed events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let matching: Vec<Trigger> = registry
            .read()
            .values()
            .filter(|t| t.event_filter().is_some_and(|f| f.matches(&event)))
            .cloned()
            .collect();

        for trigger in matching {
            match trigger.debounce {
                None => fire(&broker, &store, &trigger).await,
                Some(delay) => {
                    // One pending fire per trigger; further events within
                    // the window are coalesced into it.
                    if debouncing.lock().insert(trigger.id.clone()) {
                        let broker = broker.clone();
                        let store = store.clone();
                        let debouncing = debouncing.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::time::sleep(delay) => {
                                    fire(&broker, &store, &trigger).await;
                                }
                            }
                            debouncing.lock().remove(&trigger.id);
                        });
                    }
                }
            }
        }
    }
}
