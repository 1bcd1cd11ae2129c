//! In-memory scheduler backend.
//!
//! A single timer-ordered min-heap in one process. The fire loop sleeps
//! until the earliest due time, fires everything due, recomputes the next
//! fire for perpetual triggers and goes back to sleep. Not safe across
//! processes; intended for single-instance deployments only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::jobs::Broker;

use super::storage::TriggerStore;
use super::trigger::Trigger;
use super::{fire, run_event_loop, EventTriggerRegistry, Scheduler};

/// Poll interval when no trigger is scheduled.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Timer-kind triggers with their scheduled fire times.
///
/// Removal is lazy: heap entries are validated against `next` when popped,
/// so `remove` only has to drop the trigger from the maps.
#[derive(Default)]
struct TimerState {
    live: HashMap<String, Trigger>,
    next: HashMap<String, DateTime<Utc>>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
}

impl TimerState {
    fn schedule(&mut self, trigger: Trigger, from: DateTime<Utc>) {
        if let Some(at) = trigger.next_fire(from) {
            self.next.insert(trigger.id.clone(), at);
            self.heap.push(Reverse((at, trigger.id.clone())));
            self.live.insert(trigger.id.clone(), trigger);
        }
    }

    fn remove(&mut self, id: &str) {
        self.live.remove(id);
        self.next.remove(id);
    }

    fn entry_is_current(&self, at: DateTime<Utc>, id: &str) -> bool {
        self.next.get(id) == Some(&at)
    }

    /// Earliest scheduled fire time, pruning stale heap entries.
    fn peek_earliest(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((at, id))) = self.heap.peek().cloned() {
            if self.entry_is_current(at, &id) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every trigger due up to `target`, rescheduling perpetual ones
    /// relative to their fire time.
    fn take_due(&mut self, target: DateTime<Utc>) -> Vec<Trigger> {
        let mut due = Vec::new();
        loop {
            match self.heap.peek() {
                Some(Reverse((at, _))) if *at <= target => {}
                _ => break,
            }
            let Some(Reverse((at, id))) = self.heap.pop() else {
                break;
            };
            if !self.entry_is_current(at, &id) {
                continue;
            }
            let Some(trigger) = self.live.get(&id).cloned() else {
                continue;
            };
            match trigger.next_fire(at) {
                Some(next) => {
                    self.next.insert(id.clone(), next);
                    self.heap.push(Reverse((next, id)));
                }
                None => self.remove(&id),
            }
            due.push(trigger);
        }
        due
    }
}

pub struct MemScheduler {
    store: Arc<dyn TriggerStore>,
    bus: EventBus,
    state: Arc<Mutex<TimerState>>,
    registry: EventTriggerRegistry,
    wake: Arc<Notify>,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MemScheduler {
    pub fn new(store: Arc<dyn TriggerStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            state: Arc::new(Mutex::new(TimerState::default())),
            registry: EventTriggerRegistry::default(),
            wake: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Scheduler for MemScheduler {
    async fn start(&self, broker: Arc<dyn Broker>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let triggers = self.store.all().await?;
        let now = Utc::now();
        let mut overdue = Vec::new();
        {
            let mut state = self.state.lock();
            let mut registry = self.registry.write();
            for trigger in triggers {
                if !trigger.is_timer() {
                    registry.insert(trigger.id.clone(), trigger);
                } else if trigger.is_one_shot() && trigger.next_fire(now).is_none() {
                    // Came due while the process was down.
                    overdue.push(trigger);
                } else {
                    state.schedule(trigger, now);
                }
            }
        }

        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(fire_loop(
                self.state.clone(),
                self.store.clone(),
                broker.clone(),
                self.wake.clone(),
                self.cancel.child_token(),
            )));
            tasks.push(tokio::spawn(run_event_loop(
                self.bus.clone(),
                self.registry.clone(),
                broker.clone(),
                self.store.clone(),
                self.cancel.child_token(),
            )));
        }

        for trigger in &overdue {
            fire(&broker, &self.store, trigger).await;
        }

        info!("in-memory scheduler started");
        Ok(())
    }

    async fn add(&self, trigger: Trigger) -> Result<()> {
        trigger.validate()?;
        self.store.put(&trigger).await?;

        if self.started.load(Ordering::SeqCst) {
            if trigger.is_timer() {
                self.state.lock().schedule(trigger, Utc::now());
                self.wake.notify_one();
            } else {
                self.registry.write().insert(trigger.id.clone(), trigger);
            }
        }
        Ok(())
    }

    async fn remove(&self, trigger_id: &str) -> Result<()> {
        if self.store.get(trigger_id).await?.is_none() {
            return Err(Error::NotFound(trigger_id.to_string()));
        }
        self.store.delete(trigger_id).await?;
        self.state.lock().remove(trigger_id);
        self.registry.write().remove(trigger_id);
        self.wake.notify_one();
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Trigger>> {
        self.store.all().await
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Dedicated loop firing timer triggers.
///
/// Deadlines are anchored once against the monotonic clock so the loop
/// fires on schedule even when timers are driven by a test clock.
async fn fire_loop(
    state: Arc<Mutex<TimerState>>,
    store: Arc<dyn TriggerStore>,
    broker: Arc<dyn Broker>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    let anchor_instant = tokio::time::Instant::now();
    let anchor_time = Utc::now();

    loop {
        let earliest = state.lock().peek_earliest();
        let deadline = match earliest {
            Some(at) => {
                let offset = (at - anchor_time).to_std().unwrap_or_default();
                anchor_instant + offset
            }
            None => tokio::time::Instant::now() + IDLE_SLEEP,
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            // A trigger was added or removed; recompute the earliest due.
            _ = wake.notified() => continue,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let Some(target) = earliest else { continue };
        let due = state.lock().take_due(target);
        debug!(count = due.len(), "firing due triggers");
        for trigger in &due {
            fire(&broker, &store, trigger).await;
        }
    }
}
