use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, error, info};

use crate::engine::Engine;

const REMINDER_INTERVAL: Duration = Duration::from_secs(60);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Publish reminders for appointments starting within the lead time. Runs
/// once a minute for the life of the tenant.
pub async fn run_reminders(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(REMINDER_INTERVAL);
    loop {
        interval.tick().await;
        sweep_reminders(&engine, chrono::Utc::now().naive_utc()).await;
    }
}

/// One reminder pass against wall-clock `now`. Returns how many went out.
pub async fn sweep_reminders(engine: &Engine, now: NaiveDateTime) -> usize {
    let mut sent = 0;
    for id in engine.due_reminders(now).await {
        match engine.send_reminder(id).await {
            Ok(true) => {
                sent += 1;
                metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL).increment(1);
                info!("reminder sent for appointment {id}");
            }
            // Cancelled or reminded between the scan and the write.
            Ok(false) => debug!("reminder skip {id}"),
            Err(e) => error!("reminder for {id} failed: {e}"),
        }
    }
    sent
}

/// Rewrite the WAL once enough appends have piled up since the last
/// compaction. Also drops notification channels nobody listens on.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        engine.notify.prune();
        compact_if_needed(&engine, threshold).await;
    }
}

pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    info!("compacting WAL ({appends} appends since last compact)");
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}
