//! Domain event feed.
//!
//! The wider server emits an event whenever a document is created, updated
//! or deleted. Event-kind triggers subscribe to this feed and fire matching
//! jobs without going through the scheduler's timer path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

/// What happened to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventVerb {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for EventVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

impl FromStr for EventVerb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown event verb: {other}")),
        }
    }
}

/// A change notification from the document layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Collection the document belongs to (e.g. `io.cumulus.files`).
    pub doctype: String,
    pub verb: EventVerb,
    /// The document after the change, as stored.
    #[serde(default)]
    pub doc: serde_json::Value,
}

impl DomainEvent {
    pub fn new(doctype: impl Into<String>, verb: EventVerb, doc: serde_json::Value) -> Self {
        Self {
            doctype: doctype.into(),
            verb,
            doc,
        }
    }
}

/// Broadcast bus carrying [`DomainEvent`]s to every subscriber.
///
/// Cloning is cheap; all clones publish into the same channel. Slow
/// subscribers that lag past the buffer lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Events with no subscriber are dropped silently.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers, for observability.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
