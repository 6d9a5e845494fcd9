//! PostgreSQL ledger store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{CasOutcome, LedgerStore};
use crate::db;
use crate::error::{LedgerError, LedgerResult};
use crate::loan::{Loan, LoanUpdate, NewLoan, Repayment, RepaymentApplied, RepaymentWrite};
use crate::models::{
    NewNotification, NewTransaction, Notification, PhoneNumber, Transaction,
    TransactionDirection, User, UserProfileUpdate,
};
use crate::sync::{
    ChangeRecord, ChangedEntity, NewQueueItem, NewResolutionRecord, ResolutionRecord,
    SyncQueueItem,
};

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn ping(&self) -> LedgerResult<()> {
        db::check_health(&self.pool)
            .await
            .map_err(|e| LedgerError::Transient(e.to_string()))
    }

    async fn get_user(&self, id: Uuid) -> LedgerResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn get_user_by_phone(&self, phone: &PhoneNumber) -> LedgerResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE phone_number = $1")
            .bind(phone.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn update_user_profile(
        &self,
        user_id: Uuid,
        expected_version: i64,
        update: &UserProfileUpdate,
    ) -> LedgerResult<CasOutcome<User>> {
        let updated = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET full_name = COALESCE($1, full_name),
                email = COALESCE($2, email),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $3 AND version = $4
            RETURNING *
            "#,
        )
        .bind(&update.full_name)
        .bind(&update.email)
        .bind(user_id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(user) = updated {
            return Ok(CasOutcome::Updated(user));
        }

        self.get_user(user_id)
            .await?
            .map(CasOutcome::Stale)
            .ok_or_else(|| LedgerError::NotFound(format!("User {}", user_id)))
    }

    async fn get_loan(&self, id: Uuid) -> LedgerResult<Option<Loan>> {
        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(loan)
    }

    async fn insert_loan(&self, loan: NewLoan) -> LedgerResult<Loan> {
        let loan = sqlx::query_as::<_, Loan>(
            r#"
            INSERT INTO loans (
                id, borrower_id, lender_id, principal_amount, remaining_balance,
                repayment_method, repayment_value, status, client_reference,
                version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $4, $5, $6, 'pending', $7, 1, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(loan.borrower_id)
        .bind(loan.lender_id)
        .bind(loan.principal_amount)
        .bind(loan.repayment_method)
        .bind(loan.repayment_value)
        .bind(&loan.client_reference)
        .fetch_one(&self.pool)
        .await?;

        Ok(loan)
    }

    async fn get_loan_by_client_reference(&self, reference: &str) -> LedgerResult<Option<Loan>> {
        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE client_reference = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;
        Ok(loan)
    }

    async fn settleable_loans_for_borrower(&self, borrower_id: Uuid) -> LedgerResult<Vec<Loan>> {
        let loans = sqlx::query_as::<_, Loan>(
            r#"
            SELECT * FROM loans
            WHERE borrower_id = $1 AND status = 'active' AND remaining_balance > 0
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(borrower_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(loans)
    }

    async fn update_loan(&self, update: LoanUpdate) -> LedgerResult<CasOutcome<Loan>> {
        let updated = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans
            SET status = $1,
                repayment_method = $2,
                repayment_value = $3,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $4 AND version = $5
            RETURNING *
            "#,
        )
        .bind(update.status)
        .bind(update.repayment_method)
        .bind(update.repayment_value)
        .bind(update.loan_id)
        .bind(update.expected_version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(loan) = updated {
            return Ok(CasOutcome::Updated(loan));
        }

        self.get_loan(update.loan_id)
            .await?
            .map(CasOutcome::Stale)
            .ok_or_else(|| LedgerError::NotFound(format!("Loan {}", update.loan_id)))
    }

    async fn apply_repayment(&self, write: RepaymentWrite) -> LedgerResult<RepaymentApplied> {
        let mut tx = self.pool.begin().await?;

        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1 FOR UPDATE")
            .bind(write.loan_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Loan {}", write.loan_id)))?;

        let existing = sqlx::query_as::<_, Repayment>(
            "SELECT * FROM repayments WHERE transaction_id = $1 AND loan_id = $2",
        )
        .bind(write.transaction_id)
        .bind(write.loan_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(repayment) = existing {
            tx.rollback().await?;
            return Ok(RepaymentApplied::Duplicate(repayment));
        }

        if loan.version != write.expected_version {
            tx.rollback().await?;
            return Ok(RepaymentApplied::VersionConflict { current: loan });
        }

        if write.new_balance < 0 || write.new_balance > loan.remaining_balance {
            tx.rollback().await?;
            return Err(LedgerError::Validation(format!(
                "Balance {} out of range for loan {}",
                write.new_balance, loan.id
            )));
        }

        let loan = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans
            SET remaining_balance = $1,
                status = $2,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $3 AND version = $4
            RETURNING *
            "#,
        )
        .bind(write.new_balance)
        .bind(write.new_status)
        .bind(write.loan_id)
        .bind(write.expected_version)
        .fetch_one(&mut *tx)
        .await?;

        let repayment = sqlx::query_as::<_, Repayment>(
            r#"
            INSERT INTO repayments (
                id, loan_id, transaction_id, borrower_id, lender_id,
                amount_deducted, remaining_balance_after, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 1, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(loan.id)
        .bind(write.transaction_id)
        .bind(loan.borrower_id)
        .bind(loan.lender_id)
        .bind(write.amount_deducted)
        .bind(write.new_balance)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RepaymentApplied::Applied { repayment, loan })
    }

    async fn insert_transaction(&self, new_tx: NewTransaction) -> LedgerResult<Transaction> {
        let mut tx = self.pool.begin().await?;

        let transaction = sqlx::query_as::<_, Transaction>(
            r#"
            INSERT INTO transactions (
                id, user_id, amount, direction, source_phone, description,
                external_reference, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 1, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new_tx.user_id)
        .bind(new_tx.amount)
        .bind(new_tx.direction)
        .bind(&new_tx.source_phone)
        .bind(&new_tx.description)
        .bind(&new_tx.external_reference)
        .fetch_one(&mut *tx)
        .await?;

        let delta = match new_tx.direction {
            TransactionDirection::Incoming => new_tx.amount,
            TransactionDirection::Outgoing => -new_tx.amount,
        };
        let credited = sqlx::query(
            r#"
            UPDATE users
            SET wallet_balance = wallet_balance + $1,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(delta)
        .bind(new_tx.user_id)
        .execute(&mut *tx)
        .await?;

        if credited.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(LedgerError::NotFound(format!("User {}", new_tx.user_id)));
        }

        tx.commit().await?;

        Ok(transaction)
    }

    async fn get_transaction(&self, id: Uuid) -> LedgerResult<Option<Transaction>> {
        let transaction =
            sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(transaction)
    }

    async fn get_transaction_by_reference(
        &self,
        reference: &str,
    ) -> LedgerResult<Option<Transaction>> {
        let transaction = sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE external_reference = $1",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(transaction)
    }

    async fn repayments_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> LedgerResult<Vec<Repayment>> {
        let repayments = sqlx::query_as::<_, Repayment>(
            "SELECT * FROM repayments WHERE transaction_id = $1 ORDER BY created_at ASC",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(repayments)
    }

    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> LedgerResult<Notification> {
        let record = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (id, user_id, loan_id, repayment_id, kind, message, read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(notification.user_id)
        .bind(notification.loan_id)
        .bind(notification.repayment_id)
        .bind(notification.kind)
        .bind(&notification.message)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn notifications_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> LedgerResult<Vec<Notification>> {
        let records = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn insert_queue_item(&self, item: NewQueueItem) -> LedgerResult<SyncQueueItem> {
        // `sequence` is a BIGSERIAL column
        let record = sqlx::query_as::<_, SyncQueueItem>(
            r#"
            INSERT INTO sync_queue (
                id, entity_type, operation, payload, owner_phone, created_at,
                synced, retry_count
            )
            VALUES ($1, $2, $3, $4, $5, NOW(), FALSE, 0)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(item.entity_type)
        .bind(item.operation)
        .bind(&item.payload)
        .bind(item.owner_phone.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_queue_item(&self, id: Uuid) -> LedgerResult<Option<SyncQueueItem>> {
        let item = sqlx::query_as::<_, SyncQueueItem>("SELECT * FROM sync_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    async fn pending_queue_items(&self, owner: &PhoneNumber) -> LedgerResult<Vec<SyncQueueItem>> {
        let items = sqlx::query_as::<_, SyncQueueItem>(
            r#"
            SELECT * FROM sync_queue
            WHERE owner_phone = $1 AND synced = FALSE
            ORDER BY created_at ASC, sequence ASC
            "#,
        )
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn mark_queue_item_synced(&self, id: Uuid, at: DateTime<Utc>) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE sync_queue SET synced = TRUE, synced_at = $1 WHERE id = $2 AND synced = FALSE",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.get_queue_item(id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("Queue item {}", id)));
        }
        Ok(result.rows_affected() > 0)
    }

    async fn record_queue_failure(
        &self,
        id: Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<Option<SyncQueueItem>> {
        let item = sqlx::query_as::<_, SyncQueueItem>(
            r#"
            UPDATE sync_queue
            SET retry_count = retry_count + 1, last_retry_at = $1, last_error = $2
            WHERE id = $3
            RETURNING *
            "#,
        )
        .bind(at)
        .bind(error)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    async fn dead_letter_queue_item(
        &self,
        id: Uuid,
        error: &str,
        at: DateTime<Utc>,
        retry_floor: i32,
    ) -> LedgerResult<Option<SyncQueueItem>> {
        let item = sqlx::query_as::<_, SyncQueueItem>(
            r#"
            UPDATE sync_queue
            SET retry_count = GREATEST(retry_count + 1, $1), last_retry_at = $2, last_error = $3
            WHERE id = $4
            RETURNING *
            "#,
        )
        .bind(retry_floor)
        .bind(at)
        .bind(error)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    async fn reset_queue_item(&self, id: Uuid) -> LedgerResult<Option<SyncQueueItem>> {
        let item = sqlx::query_as::<_, SyncQueueItem>(
            r#"
            UPDATE sync_queue
            SET retry_count = 0, last_error = NULL
            WHERE id = $1 AND synced = FALSE
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    async fn dead_letter_items(&self, max_retries: i32) -> LedgerResult<Vec<SyncQueueItem>> {
        let items = sqlx::query_as::<_, SyncQueueItem>(
            r#"
            SELECT * FROM sync_queue
            WHERE synced = FALSE AND retry_count >= $1
            ORDER BY created_at ASC, sequence ASC
            "#,
        )
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn owners_with_pending_items(&self, max_retries: i32) -> LedgerResult<Vec<PhoneNumber>> {
        let owners = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT owner_phone FROM sync_queue
            WHERE synced = FALSE AND retry_count < $1
            GROUP BY owner_phone
            ORDER BY MIN(sequence) ASC
            "#,
        )
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        owners
            .into_iter()
            .map(|(phone,)| PhoneNumber::parse(&phone))
            .collect()
    }

    async fn insert_resolution(
        &self,
        record: NewResolutionRecord,
    ) -> LedgerResult<ResolutionRecord> {
        let stored = sqlx::query_as::<_, ResolutionRecord>(
            r#"
            INSERT INTO sync_resolutions (
                id, queue_item_id, entity_type, entity_id, strategy, winner, reason, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.queue_item_id)
        .bind(record.entity_type)
        .bind(&record.entity_id)
        .bind(&record.strategy)
        .bind(&record.winner)
        .bind(&record.reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn resolutions_for_item(
        &self,
        queue_item_id: Uuid,
    ) -> LedgerResult<Vec<ResolutionRecord>> {
        let records = sqlx::query_as::<_, ResolutionRecord>(
            "SELECT * FROM sync_resolutions WHERE queue_item_id = $1 ORDER BY created_at ASC",
        )
        .bind(queue_item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_checkpoint(&self, owner: &PhoneNumber) -> LedgerResult<Option<DateTime<Utc>>> {
        let checkpoint = sqlx::query_as::<_, (DateTime<Utc>,)>(
            "SELECT last_sync_at FROM sync_checkpoints WHERE owner_phone = $1",
        )
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(checkpoint.map(|(at,)| at))
    }

    async fn advance_checkpoint(
        &self,
        owner: &PhoneNumber,
        at: DateTime<Utc>,
    ) -> LedgerResult<DateTime<Utc>> {
        let (stored,) = sqlx::query_as::<_, (DateTime<Utc>,)>(
            r#"
            INSERT INTO sync_checkpoints (owner_phone, last_sync_at)
            VALUES ($1, $2)
            ON CONFLICT (owner_phone)
            DO UPDATE SET last_sync_at = GREATEST(sync_checkpoints.last_sync_at, EXCLUDED.last_sync_at)
            RETURNING last_sync_at
            "#,
        )
        .bind(owner.as_str())
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }

    /// Rows are stamped with `NOW()`, the start of their transaction, so a
    /// transaction still open during the feed read carries a stamp older than
    /// the read itself. The watermark stays below the start of every open
    /// transaction and uses the database clock only.
    async fn change_watermark(&self) -> LedgerResult<DateTime<Utc>> {
        let (watermark,) = sqlx::query_as::<_, (DateTime<Utc>,)>(
            r#"
            SELECT LEAST(
                clock_timestamp(),
                COALESCE(
                    (SELECT MIN(xact_start) - INTERVAL '1 microsecond'
                     FROM pg_stat_activity
                     WHERE datname = current_database()
                       AND xact_start IS NOT NULL
                       AND pid <> pg_backend_pid()),
                    clock_timestamp()
                )
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(watermark)
    }

    async fn changes_since(
        &self,
        owner: &PhoneNumber,
        since: DateTime<Utc>,
    ) -> LedgerResult<Vec<ChangeRecord>> {
        let Some(user) = self.get_user_by_phone(owner).await? else {
            return Ok(Vec::new());
        };

        let loans = sqlx::query_as::<_, Loan>(
            r#"
            SELECT * FROM loans
            WHERE (borrower_id = $1 OR lender_id = $1) AND updated_at > $2
            "#,
        )
        .bind(user.id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let transactions = sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE user_id = $1 AND updated_at > $2",
        )
        .bind(user.id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let repayments = sqlx::query_as::<_, Repayment>(
            r#"
            SELECT * FROM repayments
            WHERE (borrower_id = $1 OR lender_id = $1) AND updated_at > $2
            "#,
        )
        .bind(user.id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut changes = Vec::with_capacity(loans.len() + transactions.len() + repayments.len());
        for loan in &loans {
            changes.push(ChangeRecord {
                entity_type: ChangedEntity::Loan,
                id: loan.id,
                version: loan.version,
                updated_at: loan.updated_at,
                data: serde_json::to_value(loan)?,
            });
        }
        for tx in &transactions {
            changes.push(ChangeRecord {
                entity_type: ChangedEntity::Transaction,
                id: tx.id,
                version: tx.version,
                updated_at: tx.updated_at,
                data: serde_json::to_value(tx)?,
            });
        }
        for repayment in &repayments {
            changes.push(ChangeRecord {
                entity_type: ChangedEntity::Repayment,
                id: repayment.id,
                version: repayment.version,
                updated_at: repayment.updated_at,
                data: serde_json::to_value(repayment)?,
            });
        }

        changes.sort_by_key(|c| c.updated_at);
        Ok(changes)
    }
}
