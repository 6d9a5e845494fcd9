//! Ledger store: the single shared mutable resource
//!
//! Every mutation of a versioned row goes through a compare-and-swap on its
//! `version` column. A failed swap is reported to the caller, never retried
//! or swallowed here.

mod memory;
mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::loan::{Loan, LoanUpdate, NewLoan, Repayment, RepaymentApplied, RepaymentWrite};
use crate::models::{
    NewNotification, NewTransaction, Notification, PhoneNumber, Transaction, User,
    UserProfileUpdate,
};
use crate::sync::{
    ChangeRecord, NewQueueItem, NewResolutionRecord, ResolutionRecord, SyncQueueItem,
};

/// Result of a version-checked write
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<T> {
    Updated(T),
    /// The row's version no longer matched; carries the current row
    Stale(T),
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Connectivity probe used by health checks
    async fn ping(&self) -> LedgerResult<()>;

    // ----- users -----

    async fn get_user(&self, id: Uuid) -> LedgerResult<Option<User>>;

    async fn get_user_by_phone(&self, phone: &PhoneNumber) -> LedgerResult<Option<User>>;

    async fn update_user_profile(
        &self,
        user_id: Uuid,
        expected_version: i64,
        update: &UserProfileUpdate,
    ) -> LedgerResult<CasOutcome<User>>;

    // ----- loans -----

    async fn get_loan(&self, id: Uuid) -> LedgerResult<Option<Loan>>;

    /// Inserts a pending loan. A repeated `client_reference` yields `Duplicate`.
    async fn insert_loan(&self, loan: NewLoan) -> LedgerResult<Loan>;

    async fn get_loan_by_client_reference(&self, reference: &str) -> LedgerResult<Option<Loan>>;

    /// Active loans with a positive balance, oldest first
    async fn settleable_loans_for_borrower(&self, borrower_id: Uuid) -> LedgerResult<Vec<Loan>>;

    async fn update_loan(&self, update: LoanUpdate) -> LedgerResult<CasOutcome<Loan>>;

    /// Atomically records one allocation step. See [`RepaymentWrite`].
    async fn apply_repayment(&self, write: RepaymentWrite) -> LedgerResult<RepaymentApplied>;

    // ----- transactions and repayments -----

    /// Inserts an immutable transaction and, in the same write, credits
    /// (incoming) or debits (outgoing) the owner's wallet. A repeated
    /// `external_reference` yields `Duplicate` and touches nothing.
    async fn insert_transaction(&self, tx: NewTransaction) -> LedgerResult<Transaction>;

    async fn get_transaction(&self, id: Uuid) -> LedgerResult<Option<Transaction>>;

    async fn get_transaction_by_reference(
        &self,
        reference: &str,
    ) -> LedgerResult<Option<Transaction>>;

    async fn repayments_for_transaction(&self, transaction_id: Uuid)
        -> LedgerResult<Vec<Repayment>>;

    // ----- notifications -----

    async fn insert_notification(&self, notification: NewNotification)
        -> LedgerResult<Notification>;

    /// Newest first, at most `limit`
    async fn notifications_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> LedgerResult<Vec<Notification>>;

    // ----- sync queue -----

    async fn insert_queue_item(&self, item: NewQueueItem) -> LedgerResult<SyncQueueItem>;

    async fn get_queue_item(&self, id: Uuid) -> LedgerResult<Option<SyncQueueItem>>;

    /// Unsynced items of one owner in insertion order
    async fn pending_queue_items(&self, owner: &PhoneNumber) -> LedgerResult<Vec<SyncQueueItem>>;

    /// Sets `synced`/`synced_at`. Returns false if the item was already synced.
    async fn mark_queue_item_synced(&self, id: Uuid, at: DateTime<Utc>) -> LedgerResult<bool>;

    async fn record_queue_failure(
        &self,
        id: Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<Option<SyncQueueItem>>;

    /// Records a failure that replay can never fix: the retry counter jumps
    /// to at least `retry_floor` so the item is dead-lettered at once
    async fn dead_letter_queue_item(
        &self,
        id: Uuid,
        error: &str,
        at: DateTime<Utc>,
        retry_floor: i32,
    ) -> LedgerResult<Option<SyncQueueItem>>;

    /// Clears the retry counter of an unsynced item
    async fn reset_queue_item(&self, id: Uuid) -> LedgerResult<Option<SyncQueueItem>>;

    /// Unsynced items with `retry_count >= max_retries`, oldest first
    async fn dead_letter_items(&self, max_retries: i32) -> LedgerResult<Vec<SyncQueueItem>>;

    /// Owners that still have unsynced items below the retry ceiling
    async fn owners_with_pending_items(&self, max_retries: i32) -> LedgerResult<Vec<PhoneNumber>>;

    async fn insert_resolution(&self, record: NewResolutionRecord)
        -> LedgerResult<ResolutionRecord>;

    async fn resolutions_for_item(&self, queue_item_id: Uuid)
        -> LedgerResult<Vec<ResolutionRecord>>;

    // ----- checkpoints and change feed -----

    /// Latest instant a change feed may checkpoint at: every write not yet
    /// visible to a read started now is stamped strictly after it
    async fn change_watermark(&self) -> LedgerResult<DateTime<Utc>>;

    async fn get_checkpoint(&self, owner: &PhoneNumber) -> LedgerResult<Option<DateTime<Utc>>>;

    /// Stores `max(current, at)` and returns the stored value
    async fn advance_checkpoint(
        &self,
        owner: &PhoneNumber,
        at: DateTime<Utc>,
    ) -> LedgerResult<DateTime<Utc>>;

    /// Loans, transactions and repayments the owner takes part in with
    /// `updated_at > since`, ascending by `updated_at`
    async fn changes_since(
        &self,
        owner: &PhoneNumber,
        since: DateTime<Utc>,
    ) -> LedgerResult<Vec<ChangeRecord>>;
}
