//! Scheduled batch runs.
//!
//! Fires `run_lookback` on a cron schedule until the shutdown flag is set.
//! A tick that lands while a batch is still running is skipped.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ConfigError, PipelineError};
use crate::mailbox::Mailbox;
use crate::pipeline::orchestrator::TriageOrchestrator;

/// Upper bound on one sleep, so shutdown is noticed promptly.
const MAX_SLEEP: Duration = Duration::from_secs(60);

pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "TRIAGE_SCHEDULE".to_string(),
        message: format!("invalid cron expression '{expr}': {e}"),
    })
}

/// Next fire time strictly after `after`.
pub fn next_fire(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Spawn the schedule loop. Returns the task handle and its shutdown flag.
pub fn spawn_scheduled_runs(
    orchestrator: Arc<TriageOrchestrator>,
    mailbox: Arc<dyn Mailbox>,
    schedule: cron::Schedule,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Scheduled triage runs started");
        let mut next = next_fire(&schedule, Utc::now());

        while let Some(fire_at) = next {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let now = Utc::now();
            if fire_at > now {
                let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait.min(MAX_SLEEP)).await;
                continue;
            }

            match orchestrator.run_lookback(mailbox.as_ref(), None).await {
                Ok(summary) => info!(
                    synced = summary.synced,
                    failed = summary.failed,
                    duplicates = summary.duplicates,
                    "Scheduled run finished"
                ),
                Err(PipelineError::BatchInProgress) => {
                    warn!("Scheduled run skipped: batch already running")
                }
                Err(e) => error!(error = %e, "Scheduled run failed"),
            }
            next = next_fire(&schedule, Utc::now());
        }
        info!("Scheduled triage runs stopped");
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_schedule() {
        let schedule = parse_schedule("0 0 * * * *").unwrap();
        let now = Utc::now();
        let next = next_fire(&schedule, now).unwrap();
        assert!(next > now);
        assert!(next - now <= chrono::Duration::hours(1));
    }

    #[test]
    fn rejects_invalid_schedule() {
        assert!(matches!(
            parse_schedule("every tuesday"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
