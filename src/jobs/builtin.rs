//! Built-in worker catalogue.
//!
//! Small handlers used by the dev binary and the tests. Real deployments
//! extend the list with their own registrations at startup.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::handler::{JobHandler, WorkerConfig, WorkersList};
use super::job::{ExecResult, Job};

/// Logs its payload at info level.
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn handle(&self, job: &Job) -> ExecResult {
        info!(job_id = %job.id, payload = %job.payload, "log worker");
        Ok(None)
    }
}

/// Copies its payload to the job output.
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn handle(&self, job: &Job) -> ExecResult {
        Ok(Some(job.payload.clone()))
    }
}

/// The default catalogue: `log` and `echo`, with the given base settings.
pub fn workers_list(base: WorkerConfig) -> WorkersList {
    WorkersList::new()
        .register("log", base.clone(), Arc::new(LogHandler))
        .register("echo", base, Arc::new(EchoHandler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_returns_payload() {
        let job = Job::new("echo", json!({"msg": "hi"}));
        let output = EchoHandler.handle(&job).await.unwrap();
        assert_eq!(output, Some(json!({"msg": "hi"})));
    }

    #[tokio::test]
    async fn test_log_returns_no_output() {
        let job = Job::new("log", json!("note"));
        let output = LogHandler.handle(&job).await.unwrap();
        assert!(output.is_none());
    }

    #[test]
    fn test_default_catalogue() {
        let list = workers_list(WorkerConfig::default());
        assert!(list.contains("log"));
        assert!(list.contains("echo"));
    }
}
