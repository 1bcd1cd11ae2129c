//! Redis-backed scheduler backend.
//!
//! Due times live in a shared sorted set keyed by trigger id, with the
//! score set to the next-fire Unix timestamp. Every scheduler instance
//! ticks once a second and atomically claims all entries due by now with a
//! single Lua round trip, so a trigger fires exactly once across the whole
//! fleet even when several processes run the scheduler concurrently. A
//! check-then-delete pair would race between instances; the claim must stay
//! one script.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::jobs::Broker;

use super::storage::TriggerStore;
use super::trigger::Trigger;
use super::{fire, run_event_loop, EventTriggerRegistry, Scheduler};

const DEFAULT_PREFIX: &str = "cumulus";
const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Atomic range-pop: return and remove every member due by `ARGV[1]`.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
if #due > 0 then
  redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
end
return due
"#;

pub struct RedisScheduler {
    client: redis::Client,
    prefix: String,
    tick: Duration,
    store: Arc<dyn TriggerStore>,
    bus: EventBus,
    registry: EventTriggerRegistry,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RedisScheduler {
    pub fn new(client: redis::Client, store: Arc<dyn TriggerStore>, bus: EventBus) -> Self {
        Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            tick: DEFAULT_TICK,
            store,
            bus,
            registry: EventTriggerRegistry::default(),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Namespace the sorted set under a different prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(100));
        self
    }

    fn triggers_key(&self) -> String {
        format!("{}:triggers", self.prefix)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Insert the trigger's next due time. `NX` keeps an existing score so
    /// several instances loading the same store do not reset each other.
    /// One-shot triggers that came due while no process was running get a
    /// due-now score; the tick claim keeps their fire exclusive.
    async fn schedule_entry(&self, trigger: &Trigger, keep_existing: bool) -> Result<()> {
        let now = Utc::now();
        let at = match trigger.next_fire(now) {
            Some(at) => at,
            None if trigger.is_one_shot() => now,
            None => return Ok(()),
        };
        let mut conn = self.get_conn().await?;
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(self.triggers_key());
        if keep_existing {
            cmd.arg("NX");
        }
        cmd.arg(at.timestamp()).arg(&trigger.id);
        cmd.query_async::<_, i64>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Scheduler for RedisScheduler {
    async fn start(&self, broker: Arc<dyn Broker>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        for trigger in self.store.all().await? {
            if trigger.is_timer() {
                self.schedule_entry(&trigger, true).await?;
            } else {
                self.registry.write().insert(trigger.id.clone(), trigger);
            }
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(tick_loop(
            self.client.clone(),
            self.triggers_key(),
            self.tick,
            self.store.clone(),
            broker.clone(),
            self.cancel.child_token(),
        )));
        tasks.push(tokio::spawn(run_event_loop(
            self.bus.clone(),
            self.registry.clone(),
            broker,
            self.store.clone(),
            self.cancel.child_token(),
        )));

        info!(tick_ms = self.tick.as_millis() as u64, "redis scheduler started");
        Ok(())
    }

    async fn add(&self, trigger: Trigger) -> Result<()> {
        trigger.validate()?;
        self.store.put(&trigger).await?;
        if trigger.is_timer() {
            // Plain ZADD: a re-added trigger reschedules from now.
            self.schedule_entry(&trigger, false).await?;
        } else {
            self.registry.write().insert(trigger.id.clone(), trigger);
        }
        Ok(())
    }

    async fn remove(&self, trigger_id: &str) -> Result<()> {
        if self.store.get(trigger_id).await?.is_none() {
            return Err(Error::NotFound(trigger_id.to_string()));
        }
        self.store.delete(trigger_id).await?;
        self.registry.write().remove(trigger_id);

        let mut conn = self.get_conn().await?;
        redis::cmd("ZREM")
            .arg(self.triggers_key())
            .arg(trigger_id)
            .query_async::<_, i64>(&mut conn)
            .await?;
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

/// Claim and fire due triggers every tick.
async fn tick_loop(
    client: redis::Client,
    key: String,
    tick: Duration,
    store: Arc<dyn TriggerStore>,
    broker: Arc<dyn Broker>,
    cancel: CancellationToken,
) {
    let claim = redis::Script::new(CLAIM_SCRIPT);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(tick) => {}
        }

        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "redis connection failed, skipping tick");
                continue;
            }
        };

        let due: Vec<String> = match claim
            .key(&key)
            .arg(Utc::now().timestamp())
            .invoke_async(&mut conn)
            .await
        {
            Ok(due) => due,
            Err(err) => {
                warn!(error = %err, "due-trigger claim failed");
                continue;
            }
        };

        for id in due {
            let trigger = match store.get(&id).await {
                Ok(Some(trigger)) => trigger,
                // Deleted on another instance after its entry was claimed.
                Ok(None) => continue,
                Err(err) => {
                    error!(trigger_id = %id, error = %err, "trigger load failed");
                    continue;
                }
            };

            fire(&broker, &store, &trigger).await;

            // Only the claiming instance re-inserts perpetual triggers.
            if let Some(next) = trigger.next_fire(Utc::now()) {
                let added: std::result::Result<i64, redis::RedisError> = redis::cmd("ZADD")
                    .arg(&key)
                    .arg(next.timestamp())
                    .arg(&trigger.id)
                    .query_async(&mut conn)
                    .await;
                if let Err(err) = added {
                    error!(trigger_id = %trigger.id, error = %err, "trigger reschedule failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::builtin::EchoHandler;
    use crate::jobs::{JobState, MemBroker, WorkerConfig, WorkersList};
    use crate::scheduler::storage::MemTriggerStore;
    use crate::scheduler::trigger::TriggerKind;
    use serde_json::json;

    fn test_client() -> redis::Client {
        redis::Client::open("redis://127.0.0.1:6379").unwrap()
    }

    async fn echo_broker() -> Arc<MemBroker> {
        let broker = Arc::new(MemBroker::new());
        let workers =
            WorkersList::new().register("echo", WorkerConfig::default(), Arc::new(EchoHandler));
        broker.start(workers).await.unwrap();
        broker
    }

    // Requires a running Redis on 127.0.0.1:6379.
    #[tokio::test]
    #[ignore]
    async fn test_at_trigger_fires_and_retires() {
        let prefix = format!("cumulus-test-{}", uuid::Uuid::new_v4());
        let store = Arc::new(MemTriggerStore::new());
        let broker = echo_broker().await;
        let mut events = broker.subscribe();

        let scheduler = RedisScheduler::new(test_client(), store.clone(), EventBus::default())
            .with_prefix(&prefix)
            .with_tick(Duration::from_millis(200));
        scheduler
            .start(broker.clone() as Arc<dyn Broker>)
            .await
            .unwrap();

        let trigger = Trigger::new(
            TriggerKind::At {
                arguments: Utc::now() + chrono::Duration::seconds(1),
            },
            "echo",
            json!("from redis"),
        );
        scheduler.add(trigger).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.state, JobState::Done);
        assert_eq!(event.output, Some(json!("from redis")));
        assert!(scheduler.get_all().await.unwrap().is_empty());

        scheduler.shutdown().await;
        broker.shutdown().await;
    }

    // Requires a running Redis on 127.0.0.1:6379. Two scheduler instances
    // share one sorted set and one trigger store: the due trigger must be
    // claimed by exactly one of them.
    #[tokio::test]
    #[ignore]
    async fn test_claim_is_mutually_exclusive_across_instances() {
        let prefix = format!("cumulus-test-{}", uuid::Uuid::new_v4());
        let store = Arc::new(MemTriggerStore::new());

        let broker_a = echo_broker().await;
        let broker_b = echo_broker().await;
        let mut events_a = broker_a.subscribe();
        let mut events_b = broker_b.subscribe();

        let sched_a = RedisScheduler::new(test_client(), store.clone(), EventBus::default())
            .with_prefix(&prefix)
            .with_tick(Duration::from_millis(100));
        let sched_b = RedisScheduler::new(test_client(), store.clone(), EventBus::default())
            .with_prefix(&prefix)
            .with_tick(Duration::from_millis(100));
        sched_a
            .start(broker_a.clone() as Arc<dyn Broker>)
            .await
            .unwrap();
        sched_b
            .start(broker_b.clone() as Arc<dyn Broker>)
            .await
            .unwrap();

        let trigger = Trigger::new(
            TriggerKind::At {
                arguments: Utc::now() + chrono::Duration::seconds(1),
            },
            "echo",
            json!("claim me"),
        );
        sched_a.add(trigger).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;

        let mut fires = 0;
        while events_a.try_recv().is_ok() {
            fires += 1;
        }
        while events_b.try_recv().is_ok() {
            fires += 1;
        }
        assert_eq!(fires, 1, "a due trigger must fire exactly once across the fleet");

        sched_a.shutdown().await;
        sched_b.shutdown().await;
        broker_a.shutdown().await;
        broker_b.shutdown().await;
    }
}
