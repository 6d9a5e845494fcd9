//! Sync engine: drains a phone's queue, then reports what changed on the
//! server since its checkpoint

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::conflict::{Conflict, Resolution};
use super::handlers::{EntityHandlers, ItemOutcome};
use super::incremental::IncrementalSyncManager;
use super::model::{
    ChangeRecord, QueueItemState, ResolutionRecord, SyncEntityType, SyncOperation, SyncQueueItem,
};
use super::queue::SyncQueueManager;
use crate::error::{LedgerError, LedgerResult};
use crate::locks::KeyedLocks;
use crate::models::PhoneNumber;
use crate::store::LedgerStore;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReport {
    pub id: Uuid,
    pub entity_type: SyncEntityType,
    pub operation: SyncOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemReport {
    fn new(item: &SyncQueueItem, error: Option<String>) -> Self {
        Self {
            id: item.id,
            entity_type: item.entity_type,
            operation: item.operation,
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub id: Uuid,
    pub entity_type: SyncEntityType,
    pub conflict: Conflict,
    /// Absent when the write lost a race and no resolution ran yet
    pub resolution: Option<Resolution>,
}

/// Outcome of one queue drain. Every processed item appears in exactly one
/// of `synced`, `failed` or `conflicts`.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub synced: Vec<ItemReport>,
    pub failed: Vec<ItemReport>,
    pub conflicts: Vec<ConflictReport>,
    pub resolutions: Vec<ResolutionRecord>,
    /// Dead-lettered items left for an operator
    pub dead_lettered: usize,
    pub total_items: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncResult {
    pub success: bool,
    pub phone: PhoneNumber,
    pub queue: Option<SyncResult>,
    pub previous_checkpoint: Option<DateTime<Utc>>,
    pub changes: Option<Vec<ChangeRecord>>,
    pub checkpoint: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phone: PhoneNumber,
    pub pending: usize,
    pub dead_lettered: usize,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn LedgerStore>,
    queue: SyncQueueManager,
    incremental: IncrementalSyncManager,
    handlers: EntityHandlers,
    owner_locks: KeyedLocks<PhoneNumber>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        queue: SyncQueueManager,
        incremental: IncrementalSyncManager,
        handlers: EntityHandlers,
    ) -> Self {
        Self {
            store,
            queue,
            incremental,
            handlers,
            owner_locks: KeyedLocks::new(),
        }
    }

    pub fn queue(&self) -> &SyncQueueManager {
        &self.queue
    }

    pub fn incremental(&self) -> &IncrementalSyncManager {
        &self.incremental
    }

    /// Replays the phone's pending items oldest first. One item failing
    /// never stops the rest.
    pub async fn process_queue(&self, phone: &PhoneNumber) -> LedgerResult<SyncResult> {
        let _guard = self.owner_locks.lock(phone).await;
        self.drain(phone).await
    }

    /// Queue drain, change feed, then checkpoint. A failed phase ends the
    /// run with the results of the phases that completed.
    pub async fn full_sync(&self, phone: &PhoneNumber) -> FullSyncResult {
        let started = Instant::now();
        let _guard = self.owner_locks.lock(phone).await;

        let mut result = FullSyncResult {
            success: false,
            phone: phone.clone(),
            queue: None,
            previous_checkpoint: None,
            changes: None,
            checkpoint: None,
            error: None,
            duration_ms: 0,
        };

        if let Err(e) = self.run_phases(phone, &mut result).await {
            tracing::error!(phone = %phone, error = %e, "Full sync failed");
            result.error = Some(e.to_string());
        } else {
            result.success = true;
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn run_phases(&self, phone: &PhoneNumber, result: &mut FullSyncResult) -> LedgerResult<()> {
        result.queue = Some(self.drain(phone).await?);

        let since = self.incremental.get_checkpoint(phone).await?;
        result.previous_checkpoint = Some(since);

        // Taken before the read; writes still in flight are stamped after it
        let watermark = self.incremental.watermark().await?;
        result.changes = Some(self.incremental.get_changes_since(phone, since).await?);

        result.checkpoint = Some(self.incremental.advance_checkpoint(phone, watermark).await?);

        tracing::info!(
            phone = %phone,
            changes = result.changes.as_ref().map_or(0, Vec::len),
            "Full sync complete"
        );
        Ok(())
    }

    async fn drain(&self, phone: &PhoneNumber) -> LedgerResult<SyncResult> {
        let started = Instant::now();
        let max_retries = self.queue.max_retries();
        let items = self.queue.list_pending(phone).await?;

        let mut result = SyncResult::default();

        for item in items {
            if item.state(max_retries) == QueueItemState::DeadLetter {
                result.dead_lettered += 1;
                continue;
            }
            result.total_items += 1;
            self.process_item(&item, &mut result).await;
        }

        result.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            phone = %phone,
            total = result.total_items,
            synced = result.synced.len(),
            failed = result.failed.len(),
            conflicts = result.conflicts.len(),
            dead_lettered = result.dead_lettered,
            "Sync queue processed"
        );

        Ok(result)
    }

    async fn process_item(&self, item: &SyncQueueItem, result: &mut SyncResult) {
        let handled = self.handlers.handle(item).await;

        let outcome = match handled {
            Ok(handled) => {
                result.resolutions.extend(handled.resolutions);
                Ok(handled.outcome)
            }
            // Already applied on an earlier attempt
            Err(LedgerError::Duplicate(_)) => Ok(ItemOutcome::Applied),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(ItemOutcome::Applied) | Ok(ItemOutcome::Superseded(_)) => {
                match self.queue.mark_synced(item.id).await {
                    Ok(_) => result.synced.push(ItemReport::new(item, None)),
                    Err(e) => {
                        // The effect is idempotent; a later drain marks it
                        tracing::error!(item_id = %item.id, error = %e, "Failed to mark item synced");
                        result.failed.push(ItemReport::new(item, Some(e.to_string())));
                    }
                }
            }
            Ok(ItemOutcome::Deferred {
                conflict,
                resolution,
            }) => {
                tracing::warn!(
                    item_id = %item.id,
                    entity = item.entity_type.as_str(),
                    "Queue item deferred for manual review"
                );
                result.conflicts.push(ConflictReport {
                    id: item.id,
                    entity_type: item.entity_type,
                    conflict,
                    resolution: Some(resolution),
                });
            }
            Ok(ItemOutcome::Raced(conflict)) => {
                tracing::info!(
                    item_id = %item.id,
                    entity = item.entity_type.as_str(),
                    entity_id = %conflict.entity_id,
                    server_version = conflict.server.version,
                    "Row moved during replay, item left pending"
                );
                result.conflicts.push(ConflictReport {
                    id: item.id,
                    entity_type: item.entity_type,
                    conflict,
                    resolution: None,
                });
            }
            Err(e) if !e.is_retryable() => {
                tracing::warn!(
                    item_id = %item.id,
                    entity = item.entity_type.as_str(),
                    kind = e.kind(),
                    error = %e,
                    "Queue item can never apply"
                );
                if let Err(record_err) = self.queue.reject(item.id, &e.to_string()).await {
                    tracing::error!(item_id = %item.id, error = %record_err, "Failed to dead-letter queue item");
                }
                result.failed.push(ItemReport::new(item, Some(e.to_string())));
            }
            Err(e) => {
                tracing::warn!(
                    item_id = %item.id,
                    entity = item.entity_type.as_str(),
                    kind = e.kind(),
                    error = %e,
                    "Queue item failed"
                );
                if let Err(record_err) = self.queue.record_failure(item.id, &e.to_string()).await {
                    tracing::error!(item_id = %item.id, error = %record_err, "Failed to record queue failure");
                }
                result.failed.push(ItemReport::new(item, Some(e.to_string())));
            }
        }
    }

    pub async fn sync_status(&self, phone: &PhoneNumber) -> LedgerResult<SyncStatus> {
        let max_retries = self.queue.max_retries();
        let items = self.queue.list_pending(phone).await?;
        let dead_lettered = items
            .iter()
            .filter(|i| i.state(max_retries) == QueueItemState::DeadLetter)
            .count();

        Ok(SyncStatus {
            phone: phone.clone(),
            pending: items.len() - dead_lettered,
            dead_lettered,
            oldest_pending_at: items.first().map(|i| i.created_at),
            last_sync_at: self.store.get_checkpoint(phone).await?,
        })
    }

    /// Phones with items the sweeper should retry
    pub async fn owners_with_pending_items(&self) -> LedgerResult<Vec<PhoneNumber>> {
        self.store
            .owners_with_pending_items(self.queue.max_retries())
            .await
    }
}
