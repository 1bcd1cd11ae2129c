//! Trigger documents.
//!
//! A trigger is a persisted rule: run worker `W` with payload `P` on
//! schedule or condition `C`. Kinds are a tagged union dispatched
//! exhaustively in the fire computation. Next-fire computation is pure so
//! it can be tested independently of the fire loops.

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{DomainEvent, EventVerb};
use crate::jobs::JobRequest;

/// Matches domain events by doctype and, optionally, verb.
///
/// The document form is `"<doctype>"` or `"<doctype>:<verb>"`, e.g.
/// `"io.cumulus.files:created"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventFilter {
    pub doctype: String,
    pub verb: Option<EventVerb>,
}

impl EventFilter {
    pub fn matches(&self, event: &DomainEvent) -> bool {
        if self.doctype != event.doctype {
            return false;
        }
        match self.verb {
            Some(verb) => verb == event.verb,
            None => true,
        }
    }
}

impl FromStr for EventFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (doctype, verb) = match s.split_once(':') {
            Some((doctype, verb)) => {
                let verb = verb
                    .parse::<EventVerb>()
                    .map_err(Error::InvalidTrigger)?;
                (doctype, Some(verb))
            }
            None => (s, None),
        };
        if doctype.is_empty() {
            return Err(Error::InvalidTrigger("empty event doctype".to_string()));
        }
        Ok(Self {
            doctype: doctype.to_string(),
            verb,
        })
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.verb {
            Some(verb) => write!(f, "{}:{}", self.doctype, verb),
            None => write!(f, "{}", self.doctype),
        }
    }
}

impl TryFrom<String> for EventFilter {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EventFilter> for String {
    fn from(filter: EventFilter) -> Self {
        filter.to_string()
    }
}

/// When a trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerKind {
    /// Standard five-field minute-resolution cron expression, evaluated in
    /// UTC. Six-field expressions with a leading seconds field also parse.
    Cron { arguments: String },
    /// A single future timestamp; the trigger retires after firing.
    At { arguments: DateTime<Utc> },
    /// Fixed interval between fires, e.g. `"5m"`.
    Every {
        #[serde(with = "humantime_serde")]
        arguments: Duration,
    },
    /// Fires when a matching domain event occurs; never timer-driven.
    Event { arguments: EventFilter },
}

/// A persisted rule describing when to submit a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub kind: TriggerKind,
    /// Worker type of the jobs this trigger builds.
    pub worker: String,
    /// Payload template copied into every fired job.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// For event triggers: coalesce bursts, firing once per quiet period.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub debounce: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl Trigger {
    pub fn new(kind: TriggerKind, worker: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            worker: worker.into(),
            payload,
            debounce: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    /// Check the trigger is well-formed before persisting it.
    pub fn validate(&self) -> Result<()> {
        match &self.kind {
            TriggerKind::Cron { arguments } => {
                parse_cron(arguments)?;
            }
            TriggerKind::At { arguments } => {
                if *arguments <= Utc::now() {
                    return Err(Error::InvalidTrigger(format!(
                        "at timestamp {arguments} is not in the future"
                    )));
                }
            }
            TriggerKind::Every { arguments } => {
                if arguments.is_zero() {
                    return Err(Error::InvalidTrigger("zero interval".to_string()));
                }
            }
            TriggerKind::Event { .. } => {}
        }
        if self.worker.is_empty() {
            return Err(Error::InvalidTrigger("empty worker type".to_string()));
        }
        Ok(())
    }

    /// Next fire time strictly after `after`, or `None` when the trigger
    /// has no further timer fire (event kind, expired `at`, unparsable
    /// expression). Pure: same inputs, same answer.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            TriggerKind::Cron { arguments } => {
                parse_cron(arguments).ok()?.after(&after).next()
            }
            TriggerKind::At { arguments } => (*arguments > after).then_some(*arguments),
            TriggerKind::Every { arguments } => {
                Some(after + chrono::Duration::from_std(*arguments).ok()?)
            }
            TriggerKind::Event { .. } => None,
        }
    }

    /// Whether the timer loops schedule this trigger.
    pub fn is_timer(&self) -> bool {
        !matches!(self.kind, TriggerKind::Event { .. })
    }

    /// One-shot triggers retire after a single fire.
    pub fn is_one_shot(&self) -> bool {
        matches!(self.kind, TriggerKind::At { .. })
    }

    pub fn event_filter(&self) -> Option<&EventFilter> {
        match &self.kind {
            TriggerKind::Event { arguments } => Some(arguments),
            _ => None,
        }
    }

    /// Build the job submission for one fire of this trigger.
    pub fn to_request(&self) -> JobRequest {
        JobRequest::new(self.worker.clone(), self.payload.clone()).with_trigger(self.id.clone())
    }
}

/// Parse a cron expression, accepting the standard five-field form by
/// prepending a zero seconds field (`cron::Schedule` wants six or seven).
fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|err| Error::InvalidTrigger(format!("bad cron expression {expr:?}: {err}")))
}
