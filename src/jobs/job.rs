//! Job records and execution policy.
//!
//! A [`Job`] is one unit of work: a worker type selecting the handler, an
//! opaque payload, and bookkeeping state. State transitions are monotonic
//! (`queued → running → done | errored`); a job is never re-queued. Retries
//! happen in the executing slot and only advance the attempt counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting on the worker-type queue.
    Queued,
    /// Picked up by an execution slot.
    Running,
    /// Finished successfully.
    Done,
    /// Finished in failure, after exhausting any retries.
    Errored,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Errored)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Handler failure, classified for the retry policy.
///
/// Transient errors (network hiccups, timeouts) are eligible for
/// backoff-retry; permanent errors terminate the job immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecError {
    pub message: String,
    pub retryable: bool,
}

impl ExecError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExecError {}

/// What a handler returns: an optional output value recorded on the job,
/// or a classified failure.
pub type ExecResult = std::result::Result<Option<serde_json::Value>, ExecError>;

/// Strategy for computing the delay before a retry attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay between every retry.
    Fixed { delay_secs: u64 },
    /// `initial * multiplier^attempt`, capped at `max_delay_secs`.
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_secs: 1,
            max_delay_secs: 300,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before retrying after the given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => {
                let delay = (*initial_delay_secs as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_secs as f64) as u64
            }
        };
        Duration::from_secs(secs)
    }
}

/// Retry policy applied by the executing slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, first execution included. `1` disables retry.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Whether another attempt should run after a failure.
    pub fn should_retry(&self, attempts_done: u32, error: &ExecError) -> bool {
        error.retryable && attempts_done < self.max_attempts
    }
}

/// One unit of work, owned by the broker until it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub worker_type: String,
    /// Opaque, handler-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Trigger that fired this job, when scheduler-created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    /// Execution attempts so far.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Deadline attached at submission; exceeding it errors the attempt.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Output recorded by the handler on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl Job {
    pub fn new(worker_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            worker_type: worker_type.into(),
            payload,
            state: JobState::Queued,
            trigger_id: None,
            attempts: 0,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            timeout: None,
            last_error: None,
            output: None,
        }
    }

    pub fn with_trigger(mut self, trigger_id: impl Into<String>) -> Self {
        self.trigger_id = Some(trigger_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Transition `queued → running`. No-op on any other state: transitions
    /// are monotonic and never move backwards.
    pub fn mark_running(&mut self) {
        if self.state == JobState::Queued {
            self.state = JobState::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Transition `running → done`, recording the handler output.
    pub fn mark_done(&mut self, output: Option<serde_json::Value>) {
        if self.state == JobState::Running {
            self.state = JobState::Done;
            self.finished_at = Some(Utc::now());
            self.output = output;
        }
    }

    /// Transition `running → errored`, recording the failure reason.
    pub fn mark_errored(&mut self, reason: impl Into<String>) {
        if self.state == JobState::Running {
            self.state = JobState::Errored;
            self.finished_at = Some(Utc::now());
            self.last_error = Some(reason.into());
        }
    }

    /// Wall-clock execution duration, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Completion notification emitted by a worker pool when a job reaches a
/// terminal state. Consumed for observability and by chained triggers.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: JobId,
    pub worker_type: String,
    /// Terminal state: `Done` or `Errored`.
    pub state: JobState,
    pub attempts: u32,
    pub duration: Duration,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn test_state_terminal() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Errored.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut job = Job::new("echo", serde_json::json!("hello"));
        assert_eq!(job.state, JobState::Queued);

        // Cannot finish a job that never started.
        job.mark_done(None);
        assert_eq!(job.state, JobState::Queued);

        job.mark_running();
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());

        job.mark_done(Some(serde_json::json!("hello")));
        assert_eq!(job.state, JobState::Done);
        assert!(job.finished_at.is_some());

        // Terminal states never change.
        job.mark_errored("late failure");
        assert_eq!(job.state, JobState::Done);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_mark_errored_records_reason() {
        let mut job = Job::new("mails", serde_json::Value::Null);
        job.mark_running();
        job.mark_errored("smtp unreachable");
        assert_eq!(job.state, JobState::Errored);
        assert_eq!(job.last_error.as_deref(), Some("smtp unreachable"));
    }

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffStrategy::Fixed { delay_secs: 10 };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(7), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_exponential_caps() {
        let backoff = BackoffStrategy::Exponential {
            initial_delay_secs: 1,
            max_delay_secs: 100,
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(100));
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::with_attempts(3);
        let transient = ExecError::transient("connection reset");
        let permanent = ExecError::permanent("bad payload");

        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(1, &permanent));
    }

    #[test]
    fn test_job_serde_round_trip() {
        let job = Job::new("thumbnails", serde_json::json!({"file": "a.png"}))
            .with_trigger("trigger-7")
            .with_timeout(Duration::from_secs(30));
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.worker_type, "thumbnails");
        assert_eq!(decoded.trigger_id.as_deref(), Some("trigger-7"));
        assert_eq!(decoded.timeout, Some(Duration::from_secs(30)));
    }
}
