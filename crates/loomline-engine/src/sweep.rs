// Background sweeps: human-input timeouts (every 30 s) and execution-log
// retention (hourly).

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::executor::WorkflowEngine;

const PAUSE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const LOG_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub const DEFAULT_LOG_RETENTION_HOURS: i64 = 720;

/// Spawn the pause-timeout sweep. Runs until the process exits.
pub fn spawn_pause_sweep(engine: Arc<WorkflowEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PAUSE_SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let lapsed = match engine.store().find_timed_out_pauses(Utc::now()).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "Pause sweep query failed");
                    continue;
                }
            };
            for execution in lapsed {
                info!(execution_id = %execution.id, "Timing out lapsed human interaction");
                if let Err(e) = engine.force_timeout(&execution).await {
                    warn!(execution_id = %execution.id, error = %e, "Failed to time out execution");
                }
            }
        }
    })
}

/// Spawn the hourly log-retention sweep.
pub fn spawn_log_retention_sweep(
    engine: Arc<WorkflowEngine>,
    retention_hours: i64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(LOG_SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let cutoff = Utc::now() - ChronoDuration::hours(retention_hours);
            match engine.store().prune_logs_before(cutoff).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Pruned old execution logs"),
                Err(e) => warn!(error = %e, "Log retention sweep failed"),
            }
        }
    })
}
