//! Durable trigger persistence.
//!
//! Triggers outlive process restarts, stored as documents in the server's
//! document store. The store itself is an external collaborator; the job
//! core only needs the operations below. The in-memory implementation backs
//! single-instance deployments and tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::Result;

use super::trigger::Trigger;

#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Trigger>>;
    async fn put(&self, trigger: &Trigger) -> Result<()>;
    /// Deleting an absent id is a no-op.
    async fn delete(&self, id: &str) -> Result<()>;
    async fn all(&self) -> Result<Vec<Trigger>>;
}

#[derive(Default)]
pub struct MemTriggerStore {
    docs: RwLock<HashMap<String, Trigger>>,
}

impl MemTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerStore for MemTriggerStore {
    async fn get(&self, id: &str) -> Result<Option<Trigger>> {
        Ok(self.docs.read().get(id).cloned())
    }

    async fn put(&self, trigger: &Trigger) -> Result<()> {
        self.docs
            .write()
            .insert(trigger.id.clone(), trigger.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.docs.write().remove(id);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Trigger>> {
        Ok(self.docs.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::trigger::TriggerKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_crud() {
        let store = MemTriggerStore::new();
        let trigger = Trigger::new(
            TriggerKind::Cron {
                arguments: "*/5 * * * *".to_string(),
            },
            "log",
            json!(null),
        );

        assert!(store.get(&trigger.id).await.unwrap().is_none());

        store.put(&trigger).await.unwrap();
        assert_eq!(store.get(&trigger.id).await.unwrap(), Some(trigger.clone()));
        assert_eq!(store.all().await.unwrap().len(), 1);

        store.delete(&trigger.id).await.unwrap();
        assert!(store.get(&trigger.id).await.unwrap().is_none());

        // Deleting again is a no-op.
        store.delete(&trigger.id).await.unwrap();
    }
}
