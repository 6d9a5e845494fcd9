//! In-process ledger store
//!
//! Backs `LEDGER_BACKEND=memory` for local development and the test suites.
//! A single write lock spans each multi-row operation, which gives the same
//! atomicity the Postgres store gets from transactions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CasOutcome, LedgerStore};
use crate::error::{LedgerError, LedgerResult};
use crate::loan::{
    Loan, LoanStatus, LoanUpdate, NewLoan, Repayment, RepaymentApplied, RepaymentWrite,
};
use crate::models::{
    NewNotification, NewTransaction, Notification, PhoneNumber, Transaction,
    TransactionDirection, User, UserProfileUpdate,
};
use crate::sync::{
    ChangeRecord, ChangedEntity, NewQueueItem, NewResolutionRecord, ResolutionRecord,
    SyncQueueItem,
};

#[derive(Default)]
struct Inner {
    users: Vec<User>,
    loans: Vec<Loan>,
    transactions: Vec<Transaction>,
    repayments: Vec<Repayment>,
    notifications: Vec<Notification>,
    queue: Vec<SyncQueueItem>,
    next_sequence: i64,
    checkpoints: HashMap<String, DateTime<Utc>>,
    resolutions: Vec<ResolutionRecord>,
    unavailable: bool,
    failing_loans: HashSet<Uuid>,
    /// Loan id -> number of upcoming version-checked writes that lose a race
    raced_loans: HashMap<Uuid, u32>,
}

impl Inner {
    fn check_available(&self) -> LedgerResult<()> {
        if self.unavailable {
            return Err(LedgerError::Transient("Ledger store unavailable".to_string()));
        }
        Ok(())
    }

    fn user_mut(&mut self, id: Uuid) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.id == id)
    }

    fn loan_mut(&mut self, id: Uuid) -> Option<&mut Loan> {
        self.loans.iter_mut().find(|l| l.id == id)
    }

    fn queue_item_mut(&mut self, id: Uuid) -> Option<&mut SyncQueueItem> {
        self.queue.iter_mut().find(|q| q.id == id)
    }

    /// Bumps the loan's version when a raced write is pending for it, as if
    /// another writer landed first
    fn lose_race(&mut self, loan_id: Uuid) {
        let Some(remaining) = self.raced_loans.get_mut(&loan_id) else {
            return;
        };
        *remaining -= 1;
        if *remaining == 0 {
            self.raced_loans.remove(&loan_id);
        }
        if let Some(loan) = self.loan_mut(loan_id) {
            loan.version += 1;
            loan.updated_at = Utc::now();
        }
    }
}

/// Ledger store held entirely in memory
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user with an empty wallet
    pub async fn seed_user(&self, phone: &PhoneNumber, full_name: &str) -> User {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            phone_number: phone.to_string(),
            full_name: Some(full_name.to_string()),
            email: None,
            wallet_balance: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.inner.write().await.users.push(user.clone());
        user
    }

    /// Inserts a loan that is already active with the given balance
    pub async fn seed_active_loan(&self, new_loan: NewLoan, remaining_balance: i64) -> Loan {
        let now = Utc::now();
        let loan = Loan {
            id: Uuid::new_v4(),
            borrower_id: new_loan.borrower_id,
            lender_id: new_loan.lender_id,
            principal_amount: new_loan.principal_amount,
            remaining_balance,
            repayment_method: new_loan.repayment_method,
            repayment_value: new_loan.repayment_value,
            status: LoanStatus::Active,
            client_reference: new_loan.client_reference,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.inner.write().await.loans.push(loan.clone());
        loan
    }

    /// Simulates a concurrent server-side edit by bumping the loan's version
    #[cfg(any(test, feature = "test-util"))]
    pub async fn touch_loan(&self, loan_id: Uuid) -> Option<Loan> {
        let mut inner = self.inner.write().await;
        let loan = inner.loan_mut(loan_id)?;
        loan.version += 1;
        loan.updated_at = Utc::now();
        Some(loan.clone())
    }

    /// The next `times` version-checked writes to the loan find it already
    /// moved by another writer
    #[cfg(any(test, feature = "test-util"))]
    pub async fn race_loan_writes(&self, loan_id: Uuid, times: u32) {
        let mut inner = self.inner.write().await;
        if times == 0 {
            inner.raced_loans.remove(&loan_id);
        } else {
            inner.raced_loans.insert(loan_id, times);
        }
    }

    /// While set, every operation fails with a transient error
    #[cfg(any(test, feature = "test-util"))]
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.write().await.unavailable = unavailable;
    }

    /// Makes repayment writes against one loan fail with a transient error
    #[cfg(any(test, feature = "test-util"))]
    pub async fn fail_repayments_for(&self, loan_id: Uuid, failing: bool) {
        let mut inner = self.inner.write().await;
        if failing {
            inner.failing_loans.insert(loan_id);
        } else {
            inner.failing_loans.remove(&loan_id);
        }
    }

    pub async fn repayments(&self) -> Vec<Repayment> {
        self.inner.read().await.repayments.clone()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.inner.read().await.notifications.clone()
    }

    pub async fn loans(&self) -> Vec<Loan> {
        self.inner.read().await.loans.clone()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn ping(&self) -> LedgerResult<()> {
        self.inner.read().await.check_available()
    }

    async fn get_user(&self, id: Uuid) -> LedgerResult<Option<User>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner.users.iter().find(|u| u.id == id).cloned())
    }

    async fn get_user_by_phone(&self, phone: &PhoneNumber) -> LedgerResult<Option<User>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner
            .users
            .iter()
            .find(|u| u.phone_number == phone.as_str())
            .cloned())
    }

    async fn update_user_profile(
        &self,
        user_id: Uuid,
        expected_version: i64,
        update: &UserProfileUpdate,
    ) -> LedgerResult<CasOutcome<User>> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        let user = inner
            .user_mut(user_id)
            .ok_or_else(|| LedgerError::NotFound(format!("User {}", user_id)))?;

        if user.version != expected_version {
            return Ok(CasOutcome::Stale(user.clone()));
        }
        if let Some(name) = &update.full_name {
            user.full_name = Some(name.clone());
        }
        if let Some(email) = &update.email {
            user.email = Some(email.clone());
        }
        user.version += 1;
        user.updated_at = Utc::now();
        Ok(CasOutcome::Updated(user.clone()))
    }

    async fn get_loan(&self, id: Uuid) -> LedgerResult<Option<Loan>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner.loans.iter().find(|l| l.id == id).cloned())
    }

    async fn insert_loan(&self, new_loan: NewLoan) -> LedgerResult<Loan> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;

        if let Some(reference) = &new_loan.client_reference {
            if inner
                .loans
                .iter()
                .any(|l| l.client_reference.as_deref() == Some(reference.as_str()))
            {
                return Err(LedgerError::Duplicate(format!(
                    "Loan with client reference {}",
                    reference
                )));
            }
        }

        let now = Utc::now();
        let loan = Loan {
            id: Uuid::new_v4(),
            borrower_id: new_loan.borrower_id,
            lender_id: new_loan.lender_id,
            principal_amount: new_loan.principal_amount,
            remaining_balance: new_loan.principal_amount,
            repayment_method: new_loan.repayment_method,
            repayment_value: new_loan.repayment_value,
            status: LoanStatus::Pending,
            client_reference: new_loan.client_reference,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        inner.loans.push(loan.clone());
        Ok(loan)
    }

    async fn get_loan_by_client_reference(&self, reference: &str) -> LedgerResult<Option<Loan>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner
            .loans
            .iter()
            .find(|l| l.client_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn settleable_loans_for_borrower(&self, borrower_id: Uuid) -> LedgerResult<Vec<Loan>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        let mut loans: Vec<Loan> = inner
            .loans
            .iter()
            .filter(|l| l.borrower_id == borrower_id && l.is_settleable())
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        loans.sort_by_key(|l| l.created_at);
        Ok(loans)
    }

    async fn update_loan(&self, update: LoanUpdate) -> LedgerResult<CasOutcome<Loan>> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        inner.lose_race(update.loan_id);
        let loan = inner
            .loan_mut(update.loan_id)
            .ok_or_else(|| LedgerError::NotFound(format!("Loan {}", update.loan_id)))?;

        if loan.version != update.expected_version {
            return Ok(CasOutcome::Stale(loan.clone()));
        }
        loan.status = update.status;
        loan.repayment_method = update.repayment_method;
        loan.repayment_value = update.repayment_value;
        loan.version += 1;
        loan.updated_at = Utc::now();
        Ok(CasOutcome::Updated(loan.clone()))
    }

    async fn apply_repayment(&self, write: RepaymentWrite) -> LedgerResult<RepaymentApplied> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        inner.lose_race(write.loan_id);

        if inner.failing_loans.contains(&write.loan_id) {
            return Err(LedgerError::Transient(format!(
                "Write to loan {} failed",
                write.loan_id
            )));
        }

        if let Some(existing) = inner
            .repayments
            .iter()
            .find(|r| r.transaction_id == write.transaction_id && r.loan_id == write.loan_id)
        {
            return Ok(RepaymentApplied::Duplicate(existing.clone()));
        }

        let now = Utc::now();
        let loan = inner
            .loan_mut(write.loan_id)
            .ok_or_else(|| LedgerError::NotFound(format!("Loan {}", write.loan_id)))?;

        if loan.version != write.expected_version {
            return Ok(RepaymentApplied::VersionConflict {
                current: loan.clone(),
            });
        }
        if write.new_balance < 0 || write.new_balance > loan.remaining_balance {
            return Err(LedgerError::Validation(format!(
                "Balance {} out of range for loan {}",
                write.new_balance, loan.id
            )));
        }

        loan.remaining_balance = write.new_balance;
        loan.status = write.new_status;
        loan.version += 1;
        loan.updated_at = now;
        let loan = loan.clone();

        let repayment = Repayment {
            id: Uuid::new_v4(),
            loan_id: loan.id,
            transaction_id: write.transaction_id,
            borrower_id: loan.borrower_id,
            lender_id: loan.lender_id,
            amount_deducted: write.amount_deducted,
            remaining_balance_after: write.new_balance,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        inner.repayments.push(repayment.clone());

        Ok(RepaymentApplied::Applied { repayment, loan })
    }

    async fn insert_transaction(&self, tx: NewTransaction) -> LedgerResult<Transaction> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;

        if let Some(reference) = &tx.external_reference {
            if inner
                .transactions
                .iter()
                .any(|t| t.external_reference.as_deref() == Some(reference.as_str()))
            {
                return Err(LedgerError::Duplicate(format!(
                    "Transaction with reference {}",
                    reference
                )));
            }
        }

        let now = Utc::now();
        let delta = match tx.direction {
            TransactionDirection::Incoming => tx.amount,
            TransactionDirection::Outgoing => -tx.amount,
        };
        let user = inner
            .user_mut(tx.user_id)
            .ok_or_else(|| LedgerError::NotFound(format!("User {}", tx.user_id)))?;
        user.wallet_balance = user.wallet_balance.checked_add(delta).ok_or_else(|| {
            LedgerError::Validation(format!("Wallet balance of user {} out of range", user.id))
        })?;
        user.version += 1;
        user.updated_at = now;

        let transaction = Transaction {
            id: Uuid::new_v4(),
            user_id: tx.user_id,
            amount: tx.amount,
            direction: tx.direction,
            source_phone: tx.source_phone,
            description: tx.description,
            external_reference: tx.external_reference,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        inner.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn get_transaction(&self, id: Uuid) -> LedgerResult<Option<Transaction>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn get_transaction_by_reference(
        &self,
        reference: &str,
    ) -> LedgerResult<Option<Transaction>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner
            .transactions
            .iter()
            .find(|t| t.external_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn repayments_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> LedgerResult<Vec<Repayment>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner
            .repayments
            .iter()
            .filter(|r| r.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> LedgerResult<Notification> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        let record = Notification {
            id: Uuid::new_v4(),
            user_id: notification.user_id,
            loan_id: notification.loan_id,
            repayment_id: notification.repayment_id,
            kind: notification.kind,
            message: notification.message,
            read: false,
            created_at: Utc::now(),
        };
        inner.notifications.push(record.clone());
        Ok(record)
    }

    async fn notifications_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> LedgerResult<Vec<Notification>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner
            .notifications
            .iter()
            .rev()
            .filter(|n| n.user_id == user_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn insert_queue_item(&self, item: NewQueueItem) -> LedgerResult<SyncQueueItem> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        inner.next_sequence += 1;
        let record = SyncQueueItem {
            id: Uuid::new_v4(),
            sequence: inner.next_sequence,
            entity_type: item.entity_type,
            operation: item.operation,
            payload: item.payload,
            owner_phone: item.owner_phone.to_string(),
            created_at: Utc::now(),
            synced: false,
            synced_at: None,
            retry_count: 0,
            last_retry_at: None,
            last_error: None,
        };
        inner.queue.push(record.clone());
        Ok(record)
    }

    async fn get_queue_item(&self, id: Uuid) -> LedgerResult<Option<SyncQueueItem>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner.queue.iter().find(|q| q.id == id).cloned())
    }

    async fn pending_queue_items(&self, owner: &PhoneNumber) -> LedgerResult<Vec<SyncQueueItem>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner
            .queue
            .iter()
            .filter(|q| !q.synced && q.owner_phone == owner.as_str())
            .cloned()
            .collect())
    }

    async fn mark_queue_item_synced(&self, id: Uuid, at: DateTime<Utc>) -> LedgerResult<bool> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        let item = inner
            .queue_item_mut(id)
            .ok_or_else(|| LedgerError::NotFound(format!("Queue item {}", id)))?;
        if item.synced {
            return Ok(false);
        }
        item.synced = true;
        item.synced_at = Some(at);
        Ok(true)
    }

    async fn record_queue_failure(
        &self,
        id: Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<Option<SyncQueueItem>> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        Ok(inner.queue_item_mut(id).map(|item| {
            item.retry_count += 1;
            item.last_retry_at = Some(at);
            item.last_error = Some(error.to_string());
            item.clone()
        }))
    }

    async fn dead_letter_queue_item(
        &self,
        id: Uuid,
        error: &str,
        at: DateTime<Utc>,
        retry_floor: i32,
    ) -> LedgerResult<Option<SyncQueueItem>> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        Ok(inner.queue_item_mut(id).map(|item| {
            item.retry_count = (item.retry_count + 1).max(retry_floor);
            item.last_retry_at = Some(at);
            item.last_error = Some(error.to_string());
            item.clone()
        }))
    }

    async fn reset_queue_item(&self, id: Uuid) -> LedgerResult<Option<SyncQueueItem>> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        Ok(inner
            .queue_item_mut(id)
            .filter(|item| !item.synced)
            .map(|item| {
                item.retry_count = 0;
                item.last_error = None;
                item.clone()
            }))
    }

    async fn dead_letter_items(&self, max_retries: i32) -> LedgerResult<Vec<SyncQueueItem>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner
            .queue
            .iter()
            .filter(|q| !q.synced && q.retry_count >= max_retries)
            .cloned()
            .collect())
    }

    async fn owners_with_pending_items(&self, max_retries: i32) -> LedgerResult<Vec<PhoneNumber>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        let mut owners: Vec<PhoneNumber> = Vec::new();
        for item in inner
            .queue
            .iter()
            .filter(|q| !q.synced && q.retry_count < max_retries)
        {
            let phone = PhoneNumber::parse(&item.owner_phone)?;
            if !owners.contains(&phone) {
                owners.push(phone);
            }
        }
        Ok(owners)
    }

    async fn insert_resolution(
        &self,
        record: NewResolutionRecord,
    ) -> LedgerResult<ResolutionRecord> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        let stored = ResolutionRecord {
            id: Uuid::new_v4(),
            queue_item_id: record.queue_item_id,
            entity_type: record.entity_type,
            entity_id: record.entity_id,
            strategy: record.strategy,
            winner: record.winner,
            reason: record.reason,
            created_at: Utc::now(),
        };
        inner.resolutions.push(stored.clone());
        Ok(stored)
    }

    async fn resolutions_for_item(
        &self,
        queue_item_id: Uuid,
    ) -> LedgerResult<Vec<ResolutionRecord>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner
            .resolutions
            .iter()
            .filter(|r| r.queue_item_id == Some(queue_item_id))
            .cloned()
            .collect())
    }

    async fn get_checkpoint(&self, owner: &PhoneNumber) -> LedgerResult<Option<DateTime<Utc>>> {
        let inner = self.inner.read().await;
        inner.check_available()?;
        Ok(inner.checkpoints.get(owner.as_str()).copied())
    }

    async fn advance_checkpoint(
        &self,
        owner: &PhoneNumber,
        at: DateTime<Utc>,
    ) -> LedgerResult<DateTime<Utc>> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        let stored = inner
            .checkpoints
            .entry(owner.to_string())
            .and_modify(|current| *current = (*current).max(at))
            .or_insert(at);
        Ok(*stored)
    }

    /// Writes hold the lock while they stamp rows, so anything stamped after
    /// this returns is also committed after it
    async fn change_watermark(&self) -> LedgerResult<DateTime<Utc>> {
        let inner = self.inner.write().await;
        inner.check_available()?;
        Ok(Utc::now() - chrono::Duration::microseconds(1))
    }

    async fn changes_since(
        &self,
        owner: &PhoneNumber,
        since: DateTime<Utc>,
    ) -> LedgerResult<Vec<ChangeRecord>> {
        let inner = self.inner.read().await;
        inner.check_available()?;

        let Some(user) = inner.users.iter().find(|u| u.phone_number == owner.as_str()) else {
            return Ok(Vec::new());
        };

        let mut changes = Vec::new();
        for loan in inner
            .loans
            .iter()
            .filter(|l| l.involves(user.id) && l.updated_at > since)
        {
            changes.push(ChangeRecord {
                entity_type: ChangedEntity::Loan,
                id: loan.id,
                version: loan.version,
                updated_at: loan.updated_at,
                data: serde_json::to_value(loan)?,
            });
        }
        for tx in inner
            .transactions
            .iter()
            .filter(|t| t.user_id == user.id && t.updated_at > since)
        {
            changes.push(ChangeRecord {
                entity_type: ChangedEntity::Transaction,
                id: tx.id,
                version: tx.version,
                updated_at: tx.updated_at,
                data: serde_json::to_value(tx)?,
            });
        }
        for repayment in inner.repayments.iter().filter(|r| {
            (r.borrower_id == user.id || r.lender_id == user.id) && r.updated_at > since
        }) {
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
