//! Background queue sweeper

use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};

use super::engine::SyncEngine;
use crate::ussd::SessionStore;

/// Phones drained at the same time by one sweep
const SWEEP_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub owners: usize,
    pub synced: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub sessions_purged: usize,
}

/// Retries pending queue items for every phone and purges idle USSD
/// sessions. Items of one phone are still drained in order.
pub struct QueueSweeper {
    engine: SyncEngine,
    sessions: Arc<dyn SessionStore>,
    interval: Duration,
}

impl QueueSweeper {
    pub fn new(engine: SyncEngine, sessions: Arc<dyn SessionStore>, interval: Duration) -> Self {
        Self {
            engine,
            sessions,
            interval,
        }
    }

    pub async fn run(self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Starting sync queue sweeper");

        loop {
            tokio::time::sleep(self.interval).await;
            let report = self.sweep_once().await;
            if report.owners > 0 || report.sessions_purged > 0 {
                tracing::info!(
                    owners = report.owners,
                    synced = report.synced,
                    failed = report.failed,
                    conflicts = report.conflicts,
                    sessions_purged = report.sessions_purged,
                    "Sweep complete"
                );
            }
        }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.engine.owners_with_pending_items().await {
            Ok(owners) => {
                report.owners = owners.len();
                let results: Vec<_> = stream::iter(owners)
                    .map(|phone| {
                        let engine = self.engine.clone();
                        async move {
                            let result = engine.process_queue(&phone).await;
                            (phone, result)
                        }
                    })
                    .buffer_unordered(SWEEP_CONCURRENCY)
                    .collect()
                    .await;

                for (phone, result) in results {
                    match result {
                        Ok(r) => {
                            report.synced += r.synced.len();
                            report.failed += r.failed.len();
                            report.conflicts += r.conflicts.len();
                        }
                        Err(e) => {
                            tracing::error!(phone = %phone, error = %e, "Sweep failed for phone");
                        }
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to list phones with pending items"),
        }

        match self.sessions.purge_expired().await {
            Ok(purged) => report.sessions_purged = purged,
            Err(e) => tracing::warn!(error = %e, "Failed to purge USSD sessions"),
        }

        report
    }
}
