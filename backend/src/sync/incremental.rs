//! Per-owner checkpoints and the change feed behind them

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::model::ChangeRecord;
use crate::error::LedgerResult;
use crate::models::PhoneNumber;
use crate::store::LedgerStore;

#[derive(Clone)]
pub struct IncrementalSyncManager {
    store: Arc<dyn LedgerStore>,
}

impl IncrementalSyncManager {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Last acknowledged sync time; the epoch for a phone that never synced
    pub async fn get_checkpoint(&self, owner_phone: &PhoneNumber) -> LedgerResult<DateTime<Utc>> {
        Ok(self
            .store
            .get_checkpoint(owner_phone)
            .await?
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }

    pub async fn get_changes_since(
        &self,
        owner_phone: &PhoneNumber,
        since: DateTime<Utc>,
    ) -> LedgerResult<Vec<ChangeRecord>> {
        let changes = self.store.changes_since(owner_phone, since).await?;
        tracing::debug!(
            phone = %owner_phone,
            since = %since,
            count = changes.len(),
            "Collected incremental changes"
        );
        Ok(changes)
    }

    /// Checkpoint candidate for a feed read that starts now. Taken from the
    /// store's clock, never the local one.
    pub async fn watermark(&self) -> LedgerResult<DateTime<Utc>> {
        self.store.change_watermark().await
    }

    /// Moves the checkpoint forward. An earlier timestamp leaves it unchanged.
    pub async fn advance_checkpoint(
        &self,
        owner_phone: &PhoneNumber,
        at: DateTime<Utc>,
    ) -> LedgerResult<DateTime<Utc>> {
        let stored = self.store.advance_checkpoint(owner_phone, at).await?;
        if stored > at {
            tracing::debug!(
                phone = %owner_phone,
                requested = %at,
                kept = %stored,
                "Ignored checkpoint regression"
            );
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLedgerStore;
    use chrono::Duration;

    #[tokio::test]
    async fn test_checkpoint_defaults_to_epoch_and_never_regresses() {
        let store = InMemoryLedgerStore::new();
        let manager = IncrementalSyncManager::new(Arc::new(store));
        let phone = PhoneNumber::parse("0712345678").unwrap();

        assert_eq!(
            manager.get_checkpoint(&phone).await.unwrap(),
            DateTime::<Utc>::UNIX_EPOCH
        );

        let t_new = Utc::now();
        let t_old = t_new - Duration::hours(1);
        manager.advance_checkpoint(&phone, t_new).await.unwrap();
        let kept = manager.advance_checkpoint(&phone, t_old).await.unwrap();

        assert_eq!(kept, t_new);
        assert_eq!(manager.get_checkpoint(&phone).await.unwrap(), t_new);
    }
}
