//! Durable per-owner queue of offline mutations
//!
//! Items are appended once and never deleted. After insertion only the
//! status columns change; the payload stays as it was queued.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::model::{
    NewQueueItem, NewResolutionRecord, SyncEntityType, SyncOperation, SyncQueueItem,
};
use super::payload::QueuedMutation;
use crate::error::{LedgerError, LedgerResult};
use crate::models::PhoneNumber;
use crate::store::LedgerStore;

/// Default number of failed replays before an item is dead-lettered
pub const DEFAULT_MAX_RETRIES: i32 = 5;

#[derive(Clone)]
pub struct SyncQueueManager {
    store: Arc<dyn LedgerStore>,
    max_retries: i32,
}

impl SyncQueueManager {
    pub fn new(store: Arc<dyn LedgerStore>, max_retries: i32) -> Self {
        Self { store, max_retries }
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    /// Validates and appends a mutation. Invalid payloads are rejected here
    /// and never reach the queue.
    pub async fn enqueue(
        &self,
        entity_type: SyncEntityType,
        operation: SyncOperation,
        payload: serde_json::Value,
        owner_phone: &PhoneNumber,
    ) -> LedgerResult<SyncQueueItem> {
        QueuedMutation::decode(entity_type, operation, &payload)?;

        let item = self
            .store
            .insert_queue_item(NewQueueItem {
                entity_type,
                operation,
                payload,
                owner_phone: owner_phone.clone(),
            })
            .await?;

        tracing::info!(
            item_id = %item.id,
            phone = %owner_phone,
            entity = entity_type.as_str(),
            operation = ?operation,
            "Queued offline operation"
        );

        Ok(item)
    }

    /// Unsynced items of one owner, oldest first. Dead-lettered items are
    /// included; the engine skips them.
    pub async fn list_pending(&self, owner_phone: &PhoneNumber) -> LedgerResult<Vec<SyncQueueItem>> {
        let mut items = self.store.pending_queue_items(owner_phone).await?;
        items.sort_by_key(|item| (item.created_at, item.sequence));
        Ok(items)
    }

    /// Idempotent. Returns false when the item was already synced.
    pub async fn mark_synced(&self, item_id: Uuid) -> LedgerResult<bool> {
        self.store.mark_queue_item_synced(item_id, Utc::now()).await
    }

    pub async fn record_failure(
        &self,
        item_id: Uuid,
        error: &str,
    ) -> LedgerResult<Option<SyncQueueItem>> {
        let item = self
            .store
            .record_queue_failure(item_id, error, Utc::now())
            .await?;

        if let Some(item) = &item {
            if item.retry_count >= self.max_retries {
                tracing::warn!(
                    item_id = %item.id,
                    phone = %item.owner_phone,
                    retries = item.retry_count,
                    error = %error,
                    "Queue item moved to dead letter"
                );
            }
        }

        Ok(item)
    }

    /// Dead-letters an item whose replay can never succeed, without burning
    /// through the remaining retries
    pub async fn reject(&self, item_id: Uuid, error: &str) -> LedgerResult<Option<SyncQueueItem>> {
        let item = self
            .store
            .dead_letter_queue_item(item_id, error, Utc::now(), self.max_retries)
            .await?;

        if let Some(item) = &item {
            tracing::warn!(
                item_id = %item.id,
                phone = %item.owner_phone,
                error = %error,
                "Queue item moved to dead letter"
            );
        }

        Ok(item)
    }

    pub async fn list_dead_letter(&self, max_retries: Option<i32>) -> LedgerResult<Vec<SyncQueueItem>> {
        let mut items = self
            .store
            .dead_letter_items(max_retries.unwrap_or(self.max_retries))
            .await?;
        items.sort_by_key(|item| (item.created_at, item.sequence));
        Ok(items)
    }

    /// Clears the retry counter so the next drain replays the item
    pub async fn requeue(&self, item_id: Uuid) -> LedgerResult<SyncQueueItem> {
        let item = self.unsynced_item(item_id).await?;

        let reset = self
            .store
            .reset_queue_item(item.id)
            .await?
            .ok_or_else(|| LedgerError::Conflict(format!("Queue item {} already synced", item_id)))?;

        self.store
            .insert_resolution(NewResolutionRecord {
                queue_item_id: Some(item.id),
                entity_type: item.entity_type,
                entity_id: None,
                strategy: "MANUAL".to_string(),
                winner: "local".to_string(),
                reason: format!("requeued after {} failed attempts", item.retry_count),
            })
            .await?;

        tracing::info!(item_id = %item_id, "Queue item requeued");
        Ok(reset)
    }

    /// Resolves an item without applying it
    pub async fn discard(&self, item_id: Uuid, reason: &str) -> LedgerResult<SyncQueueItem> {
        let item = self.unsynced_item(item_id).await?;

        self.store
            .insert_resolution(NewResolutionRecord {
                queue_item_id: Some(item.id),
                entity_type: item.entity_type,
                entity_id: None,
                strategy: "MANUAL".to_string(),
                winner: "server".to_string(),
                reason: format!("discarded: {}", reason),
            })
            .await?;

        if !self.mark_synced(item.id).await? {
            return Err(LedgerError::Conflict(format!(
                "Queue item {} already synced",
                item_id
            )));
        }

        tracing::info!(item_id = %item_id, reason = %reason, "Queue item discarded");

        self.store
            .get_queue_item(item_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Queue item {}", item_id)))
    }

    async fn unsynced_item(&self, item_id: Uuid) -> LedgerResult<SyncQueueItem> {
        let item = self
            .store
            .get_queue_item(item_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Queue item {}", item_id)))?;

        if item.synced {
            return Err(LedgerError::Conflict(format!(
                "Queue item {} already synced",
                item_id
            )));
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLedgerStore;
    use crate::sync::QueueItemState;
    use serde_json::json;

    fn phone() -> PhoneNumber {
        PhoneNumber::parse("0712345678").unwrap()
    }

    fn manager() -> (InMemoryLedgerStore, SyncQueueManager) {
        let store = InMemoryLedgerStore::new();
        let queue = SyncQueueManager::new(Arc::new(store.clone()), DEFAULT_MAX_RETRIES);
        (store, queue)
    }

    async fn enqueue_transaction(queue: &SyncQueueManager, amount: i64) -> SyncQueueItem {
        queue
            .enqueue(
                SyncEntityType::Transaction,
                SyncOperation::Create,
                json!({ "amount": amount }),
                &phone(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_payload() {
        let (_, queue) = manager();
        let err = queue
            .enqueue(
                SyncEntityType::Transaction,
                SyncOperation::Create,
                json!({ "amount": -5 }),
                &phone(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Validation(_)));
        assert!(queue.list_pending(&phone()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_is_fifo_per_owner() {
        let (_, queue) = manager();
        let first = enqueue_transaction(&queue, 100).await;
        let second = enqueue_transaction(&queue, 200).await;
        queue
            .enqueue(
                SyncEntityType::Transaction,
                SyncOperation::Create,
                json!({ "amount": 300 }),
                &PhoneNumber::parse("0722000111").unwrap(),
            )
            .await
            .unwrap();

        let pending = queue.list_pending(&phone()).await.unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_mark_synced_is_idempotent() {
        let (_, queue) = manager();
        let item = enqueue_transaction(&queue, 100).await;

        assert!(queue.mark_synced(item.id).await.unwrap());
        assert!(!queue.mark_synced(item.id).await.unwrap());
        assert!(queue.list_pending(&phone()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_dead_letter_without_removal() {
        let (store, queue) = manager();
        let item = enqueue_transaction(&queue, 100).await;

        for attempt in 1..=5 {
            let updated = queue
                .record_failure(item.id, "ledger unavailable")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(updated.retry_count, attempt);
        }

        let dead = queue.list_dead_letter(Some(5)).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(!dead[0].synced);
        assert_eq!(dead[0].state(5), QueueItemState::DeadLetter);
        assert_eq!(dead[0].payload, item.payload);
        assert!(store.get_queue_item(item.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_requeue_and_discard() {
        let (store, queue) = manager();
        let retried = enqueue_transaction(&queue, 100).await;
        let dropped = enqueue_transaction(&queue, 200).await;
        for _ in 0..5 {
            queue.record_failure(retried.id, "boom").await.unwrap();
            queue.record_failure(dropped.id, "boom").await.unwrap();
        }

        let reset = queue.requeue(retried.id).await.unwrap();
        assert_eq!(reset.retry_count, 0);
        assert_eq!(reset.state(5), QueueItemState::Pending);

        let discarded = queue.discard(dropped.id, "duplicate entry").await.unwrap();
        assert!(discarded.synced);
        let audit = store.resolutions_for_item(dropped.id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].reason, "discarded: duplicate entry");

        assert!(queue.list_dead_letter(None).await.unwrap().is_empty());
        assert!(matches!(
            queue.requeue(dropped.id).await.unwrap_err(),
            LedgerError::Conflict(_)
        ));
    }
}
