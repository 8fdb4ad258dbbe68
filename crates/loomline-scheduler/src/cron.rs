// Cron driver: one task per replica ticks once a second, fires entries
// whose next occurrence has arrived, and suppresses cross-replica double
// fires with a minute-bucketed lock. Missed firings while the process was
// down are not backfilled.

use chrono::{DateTime, Utc};
use loomline_contracts::TriggerIndexEntry;
use loomline_storage::{locks::minute_bucket, DistributedLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::index::parse_cron;
use crate::service::SchedulerService;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const FIRE_LOCK_TTL: Duration = Duration::from_secs(60);

pub struct CronDriver {
    service: Arc<SchedulerService>,
    lock: DistributedLock,
}

impl CronDriver {
    pub fn new(service: Arc<SchedulerService>, lock: DistributedLock) -> Self {
        Self { service, lock }
    }

    /// Run forever; spawn on a dedicated task.
    pub async fn run(self) {
        let mut last_check = Utc::now();
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            let now = Utc::now();
            if let Err(e) = self.sweep(last_check, now).await {
                warn!(error = %e, "Cron sweep failed");
            }
            last_check = now;
        }
    }

    /// Fire every active cron entry due in (last_check, now].
    async fn sweep(&self, last_check: DateTime<Utc>, now: DateTime<Utc>) -> anyhow::Result<()> {
        let rows = self.service.database().list_active_cron_triggers().await?;
        for row in rows {
            let entry: TriggerIndexEntry = row.into();
            if let Some(due_at) = next_due(&entry, last_check, now) {
                self.fire(&entry, due_at).await;
            }
        }
        Ok(())
    }

    async fn fire(&self, entry: &TriggerIndexEntry, due_at: DateTime<Utc>) {
        let lock_key = format!(
            "cron:{}:{}",
            entry.workflow_id,
            minute_bucket(due_at)
        );
        let held = match self.lock.acquire(&lock_key, FIRE_LOCK_TTL).await {
            Ok(Some(held)) => held,
            Ok(None) => {
                // A sibling replica won this minute
                debug!(workflow_id = %entry.workflow_id, "Cron fire suppressed by lock");
                return;
            }
            Err(e) => {
                warn!(workflow_id = %entry.workflow_id, error = %e, "Cron lock failed");
                return;
            }
        };

        info!(workflow_id = %entry.workflow_id, key = %entry.index_key, "Cron fired");
        let routed = self.service.fire_cron(entry, due_at).await;
        if routed.execution_id.is_none() {
            warn!(
                workflow_id = %entry.workflow_id,
                message = routed.message.as_deref().unwrap_or(""),
                "Cron execution failed to start"
            );
        }

        // Not released: the TTL keeps the minute bucket owned so a slow
        // sibling replica cannot re-fire it
        drop(held);
    }
}

/// First occurrence of the entry's schedule in (last_check, now], if any.
fn next_due(
    entry: &TriggerIndexEntry,
    last_check: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let expression = entry.config.get("cron_expression").and_then(|v| v.as_str())?;
    let schedule = parse_cron(expression).ok()?;
    let next = schedule.after(&last_check).next()?;
    if next <= now {
        Some(next)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use loomline_contracts::TriggerStatus;
    use serde_json::json;
    use uuid::Uuid;

    fn cron_entry(expression: &str) -> TriggerIndexEntry {
        TriggerIndexEntry {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            trigger_node_id: "t".to_string(),
            trigger_type: "TRIGGER".to_string(),
            trigger_subtype: "CRON".to_string(),
            index_key: format!("cron:{expression}:UTC"),
            config: json!({"cron_expression": expression}),
            status: TriggerStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_next_due_inside_window() {
        let entry = cron_entry("*/5 * * * *");
        let last = Utc.with_ymd_and_hms(2025, 6, 1, 12, 4, 30).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 1).unwrap();

        let due = next_due(&entry, last, now).unwrap();
        assert_eq!(due, Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn test_not_due_outside_window() {
        let entry = cron_entry("*/5 * * * *");
        let last = Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 1).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 6, 0).unwrap();

        assert!(next_due(&entry, last, now).is_none());
    }

    #[test]
    fn test_missed_window_only_fires_latest_once() {
        // A long gap yields the first due occurrence after last_check;
        // older misses are not backfilled one by one
        let entry = cron_entry("*/5 * * * *");
        let last = Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 1).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        let due = next_due(&entry, last, now).unwrap();
        assert_eq!(due, Utc.with_ymd_and_hms(2025, 6, 1, 11, 5, 0).unwrap());
    }

    #[test]
    fn test_bad_expression_never_due() {
        let entry = cron_entry("garbage");
        assert!(next_due(&entry, Utc::now(), Utc::now()).is_none());
    }
}
