//! Logging and metrics initialization.
//!
//! Call [`init`] once at process startup. Structured fields (`job_id`,
//! `worker_type`, `attempt`) are attached at the emission sites; metric
//! names are described here so exporters can pick up their help texts.

use metrics::{describe_counter, describe_histogram};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Initialize the tracing subscriber and register metric descriptions.
/// `RUST_LOG` overrides the configured level when set.
pub fn init(config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    if config.json_logging {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()?;
    }

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!("cumulus_jobs_total", "Total number of jobs executed");
    describe_counter!("cumulus_jobs_failed", "Total number of jobs that errored");
    describe_counter!(
        "cumulus_job_retries_total",
        "Total number of retried job attempts"
    );
    describe_counter!(
        "cumulus_trigger_fires_total",
        "Total number of trigger fires"
    );
    describe_histogram!(
        "cumulus_job_duration_seconds",
        "Job execution duration in seconds"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_safe_to_call() {
        // A second init in the same process fails on the global subscriber;
        // the first call in this test binary must succeed.
        let config = ObservabilityConfig {
            log_level: "debug".to_string(),
            json_logging: false,
        };
        let _ = init(&config);
    }
}
