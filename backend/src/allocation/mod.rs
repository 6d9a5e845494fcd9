//! Repayment allocation
//!
//! Splits one incoming payment across a borrower's active loans, oldest
//! first. The live transaction path, the carrier callback and queued replay
//! all settle payments through [`RepaymentAllocator`], so a replayed payment
//! lands exactly the way it would have landed live.
//!
//! Replays are idempotent on the transaction id: loans the transaction has
//! already paid are skipped and their deductions are subtracted from what is
//! left to allocate.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::loan::{Loan, LoanStatus, Repayment, RepaymentApplied, RepaymentWrite};
use crate::locks::KeyedLocks;
use crate::models::{NewNotification, NotificationKind};
use crate::store::LedgerStore;

/// Re-reads of a loan after a failed version check before giving up on it
const MAX_VERSION_RETRIES: u32 = 3;

/// Default minimum incoming amount that triggers allocation. The bound is
/// inclusive: an amount equal to the threshold is allocated.
pub const DEFAULT_THRESHOLD: i64 = 100;

/// One loan settled by a payment
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoanAllocation {
    pub loan_id: Uuid,
    pub repayment_id: Uuid,
    pub deducted: i64,
    pub new_balance: i64,
    pub status: LoanStatus,
}

/// A loan that could not be settled; earlier loans stay settled
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationFailure {
    pub loan_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub transaction_id: Uuid,
    pub incoming_amount: i64,
    pub allocations: Vec<LoanAllocation>,
    /// Loans this transaction had already paid before this run
    pub already_applied: Vec<Uuid>,
    /// Left in the borrower's wallet
    pub unallocated_amount: i64,
    pub errors: Vec<AllocationFailure>,
    pub skipped_below_threshold: bool,
}

impl AllocationResult {
    fn empty(transaction_id: Uuid, incoming_amount: i64) -> Self {
        Self {
            transaction_id,
            incoming_amount,
            allocations: Vec::new(),
            already_applied: Vec::new(),
            unallocated_amount: incoming_amount,
            errors: Vec::new(),
            skipped_below_threshold: false,
        }
    }

    pub fn total_allocated(&self) -> i64 {
        self.allocations.iter().map(|a| a.deducted).sum()
    }

    /// True when at least one loan failed to settle
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Which loans a payment goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationTarget {
    /// All active loans of the borrower, oldest first
    Borrower,
    /// This loan first, then the rest oldest first
    Loan(Uuid),
}

enum StepOutcome {
    Applied(Repayment, Loan),
    AlreadyApplied(Repayment),
    Skipped,
}

#[derive(Clone)]
pub struct RepaymentAllocator {
    store: Arc<dyn LedgerStore>,
    borrower_locks: KeyedLocks<Uuid>,
    threshold: i64,
}

impl RepaymentAllocator {
    pub fn new(store: Arc<dyn LedgerStore>, threshold: i64) -> Self {
        Self {
            store,
            borrower_locks: KeyedLocks::new(),
            threshold,
        }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// Allocates `incoming_amount` across the borrower's active loans
    pub async fn allocate(
        &self,
        borrower_id: Uuid,
        incoming_amount: i64,
        transaction_id: Uuid,
    ) -> LedgerResult<AllocationResult> {
        self.allocate_to(
            borrower_id,
            incoming_amount,
            transaction_id,
            AllocationTarget::Borrower,
        )
        .await
    }

    pub async fn allocate_to(
        &self,
        borrower_id: Uuid,
        incoming_amount: i64,
        transaction_id: Uuid,
        target: AllocationTarget,
    ) -> LedgerResult<AllocationResult> {
        let mut result = AllocationResult::empty(transaction_id, incoming_amount);

        if incoming_amount < self.threshold {
            tracing::debug!(
                borrower_id = %borrower_id,
                amount = incoming_amount,
                threshold = self.threshold,
                "Incoming amount below allocation threshold"
            );
            result.skipped_below_threshold = true;
            return Ok(result);
        }

        let _guard = self.borrower_locks.lock(&borrower_id).await;

        let prior: HashMap<Uuid, Repayment> = self
            .store
            .repayments_for_transaction(transaction_id)
            .await?
            .into_iter()
            .map(|r| (r.loan_id, r))
            .collect();

        let mut remaining = incoming_amount;
        for repayment in prior.values() {
            remaining -= repayment.amount_deducted;
            result.already_applied.push(repayment.loan_id);
        }

        let mut loans = self.store.settleable_loans_for_borrower(borrower_id).await?;
        if let AllocationTarget::Loan(loan_id) = target {
            match loans.iter().position(|l| l.id == loan_id) {
                Some(index) => {
                    let targeted = loans.remove(index);
                    loans.insert(0, targeted);
                }
                None => tracing::warn!(
                    loan_id = %loan_id,
                    borrower_id = %borrower_id,
                    "Targeted loan is not an active loan of this borrower, allocating oldest first"
                ),
            }
        }

        for loan in loans {
            if remaining <= 0 {
                break;
            }
            if prior.contains_key(&loan.id) {
                continue;
            }

            let loan_id = loan.id;
            match self
                .settle_loan(loan, incoming_amount, remaining, transaction_id)
                .await
            {
                Ok(StepOutcome::Applied(repayment, loan)) => {
                    remaining -= repayment.amount_deducted;
                    self.notify(&repayment, &loan).await;
                    result.allocations.push(LoanAllocation {
                        loan_id: loan.id,
                        repayment_id: repayment.id,
                        deducted: repayment.amount_deducted,
                        new_balance: loan.remaining_balance,
                        status: loan.status,
                    });
                }
                Ok(StepOutcome::AlreadyApplied(repayment)) => {
                    remaining -= repayment.amount_deducted;
                    result.already_applied.push(repayment.loan_id);
                }
                Ok(StepOutcome::Skipped) => {}
                Err(e) => {
                    tracing::error!(
                        loan_id = %loan_id,
                        transaction_id = %transaction_id,
                        error = %e,
                        "Failed to apply repayment to loan"
                    );
                    result.errors.push(AllocationFailure {
                        loan_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        result.unallocated_amount = remaining.max(0);

        tracing::info!(
            borrower_id = %borrower_id,
            transaction_id = %transaction_id,
            allocated = result.total_allocated(),
            unallocated = result.unallocated_amount,
            loans = result.allocations.len(),
            "Repayment allocation complete"
        );

        Ok(result)
    }

    async fn settle_loan(
        &self,
        mut loan: Loan,
        incoming_amount: i64,
        remaining: i64,
        transaction_id: Uuid,
    ) -> LedgerResult<StepOutcome> {
        for _ in 0..MAX_VERSION_RETRIES {
            let deduction = loan
                .due_from(incoming_amount)
                .min(remaining)
                .min(loan.remaining_balance);
            if deduction <= 0 {
                return Ok(StepOutcome::Skipped);
            }

            let new_balance = loan.remaining_balance - deduction;
            let write = RepaymentWrite {
                loan_id: loan.id,
                transaction_id,
                expected_version: loan.version,
                amount_deducted: deduction,
                new_balance,
                new_status: loan.status_after(new_balance),
            };

            match self.store.apply_repayment(write).await? {
                RepaymentApplied::Applied { repayment, loan } => {
                    return Ok(StepOutcome::Applied(repayment, loan))
                }
                RepaymentApplied::Duplicate(repayment) => {
                    return Ok(StepOutcome::AlreadyApplied(repayment))
                }
                RepaymentApplied::VersionConflict { current } => {
                    tracing::debug!(
                        loan_id = %current.id,
                        expected = loan.version,
                        actual = current.version,
                        "Loan changed during allocation, re-reading"
                    );
                    if !current.is_settleable() {
                        return Ok(StepOutcome::Skipped);
                    }
                    loan = current;
                }
            }
        }

        Err(LedgerError::Conflict(format!(
            "Loan {} kept changing during allocation",
            loan.id
        )))
    }

    /// One message to each party. Losing one is logged, never propagated.
    async fn notify(&self, repayment: &Repayment, loan: &Loan) {
        let completed = loan.status == LoanStatus::Completed;
        let kind = if completed {
            NotificationKind::LoanCompleted
        } else {
            NotificationKind::Repayment
        };

        let borrower_message = if completed {
            format!(
                "KES {} deducted. Your loan is fully repaid.",
                repayment.amount_deducted
            )
        } else {
            format!(
                "KES {} deducted for loan repayment. Remaining balance: KES {}",
                repayment.amount_deducted, loan.remaining_balance
            )
        };
        let lender_message = if completed {
            format!(
                "Received KES {}. Your loan has been fully repaid.",
                repayment.amount_deducted
            )
        } else {
            format!(
                "Received KES {} loan repayment. Outstanding: KES {}",
                repayment.amount_deducted, loan.remaining_balance
            )
        };

        for (user_id, message) in [
            (loan.borrower_id, borrower_message),
            (loan.lender_id, lender_message),
        ] {
            let notification = NewNotification {
                user_id,
                loan_id: Some(loan.id),
                repayment_id: Some(repayment.id),
                kind,
                message,
            };
            if let Err(e) = self.store.insert_notification(notification).await {
                tracing::warn!(
                    user_id = %user_id,
                    loan_id = %loan.id,
                    error = %e,
                    "Failed to send repayment notification"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loan::{NewLoan, RepaymentMethod};
    use crate::models::{NewTransaction, PhoneNumber, TransactionDirection, User};
    use crate::store::InMemoryLedgerStore;

    struct Fixture {
        store: InMemoryLedgerStore,
        allocator: RepaymentAllocator,
        borrower: User,
        lender: User,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryLedgerStore::new();
        let borrower = store
            .seed_user(&PhoneNumber::parse("0712345678").unwrap(), "Borrower")
            .await;
        let lender = store
            .seed_user(&PhoneNumber::parse("0722000111").unwrap(), "Lender")
            .await;
        let allocator = RepaymentAllocator::new(Arc::new(store.clone()), DEFAULT_THRESHOLD);
        Fixture {
            store,
            allocator,
            borrower,
            lender,
        }
    }

    async fn active_loan(f: &Fixture, method: RepaymentMethod, value: i64, balance: i64) -> Loan {
        f.store
            .seed_active_loan(
                NewLoan {
                    borrower_id: f.borrower.id,
                    lender_id: f.lender.id,
                    principal_amount: 5000,
                    repayment_method: method,
                    repayment_value: value,
                    client_reference: None,
                },
                balance,
            )
            .await
    }

    async fn incoming(f: &Fixture, amount: i64) -> Uuid {
        f.store
            .insert_transaction(NewTransaction {
                user_id: f.borrower.id,
                amount,
                direction: TransactionDirection::Incoming,
                source_phone: None,
                description: None,
                external_reference: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_fixed_deduction_leaves_remainder_unallocated() {
        let f = fixture().await;
        let loan = active_loan(&f, RepaymentMethod::Fixed, 500, 4500).await;
        let tx = incoming(&f, 1000).await;

        let result = f.allocator.allocate(f.borrower.id, 1000, tx).await.unwrap();

        assert_eq!(result.allocations.len(), 1);
        assert_eq!(result.allocations[0].deducted, 500);
        assert_eq!(result.allocations[0].new_balance, 4000);
        assert_eq!(result.allocations[0].status, LoanStatus::Active);
        assert_eq!(result.unallocated_amount, 500);

        let stored = f.store.get_loan(loan.id).await.unwrap().unwrap();
        assert_eq!(stored.remaining_balance, 4000);
        assert_eq!(stored.status, LoanStatus::Active);
        assert_eq!(f.store.repayments().await.len(), 1);
        assert_eq!(f.store.notifications().await.len(), 2);
    }

    #[tokio::test]
    async fn test_deduction_capped_at_balance_completes_loan() {
        let f = fixture().await;
        let loan = active_loan(&f, RepaymentMethod::Fixed, 500, 200).await;
        let tx = incoming(&f, 1000).await;

        let result = f.allocator.allocate(f.borrower.id, 1000, tx).await.unwrap();

        assert_eq!(result.allocations[0].deducted, 200);
        assert_eq!(result.unallocated_amount, 800);
        let stored = f.store.get_loan(loan.id).await.unwrap().unwrap();
        assert_eq!(stored.remaining_balance, 0);
        assert_eq!(stored.status, LoanStatus::Completed);
    }

    #[tokio::test]
    async fn test_percentage_uses_full_incoming_amount() {
        let f = fixture().await;
        active_loan(&f, RepaymentMethod::Fixed, 600, 4000).await;
        let second = active_loan(&f, RepaymentMethod::Percentage, 10, 4000).await;
        let tx = incoming(&f, 1000).await;

        let result = f.allocator.allocate(f.borrower.id, 1000, tx).await.unwrap();

        let pct = result
            .allocations
            .iter()
            .find(|a| a.loan_id == second.id)
            .unwrap();
        assert_eq!(pct.deducted, 100);
        assert_eq!(result.unallocated_amount, 300);
    }

    #[tokio::test]
    async fn test_below_threshold_is_empty_not_error() {
        let f = fixture().await;
        active_loan(&f, RepaymentMethod::Fixed, 500, 4500).await;
        let tx = incoming(&f, 99).await;

        let result = f.allocator.allocate(f.borrower.id, 99, tx).await.unwrap();

        assert!(result.skipped_below_threshold);
        assert!(result.allocations.is_empty());
        assert_eq!(result.unallocated_amount, 99);
        assert!(f.store.repayments().await.is_empty());
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let f = fixture().await;
        let loan = active_loan(&f, RepaymentMethod::Fixed, 500, 4500).await;
        let tx = incoming(&f, 1000).await;

        f.allocator.allocate(f.borrower.id, 1000, tx).await.unwrap();
        let replay = f.allocator.allocate(f.borrower.id, 1000, tx).await.unwrap();

        assert!(replay.allocations.is_empty());
        assert_eq!(replay.already_applied, vec![loan.id]);
        assert_eq!(replay.unallocated_amount, 500);
        assert_eq!(f.store.repayments().await.len(), 1);
        let stored = f.store.get_loan(loan.id).await.unwrap().unwrap();
        assert_eq!(stored.remaining_balance, 4000);
    }

    #[tokio::test]
    async fn test_failed_loan_does_not_undo_earlier_loans() {
        let f = fixture().await;
        let first = active_loan(&f, RepaymentMethod::Fixed, 300, 1000).await;
        let second = active_loan(&f, RepaymentMethod::Fixed, 300, 1000).await;
        let third = active_loan(&f, RepaymentMethod::Fixed, 300, 1000).await;
        f.store.fail_repayments_for(second.id, true).await;
        let tx = incoming(&f, 1000).await;

        let result = f.allocator.allocate(f.borrower.id, 1000, tx).await.unwrap();

        assert!(result.is_partial());
        assert_eq!(result.errors[0].loan_id, second.id);
        let settled: Vec<Uuid> = result.allocations.iter().map(|a| a.loan_id).collect();
        assert_eq!(settled, vec![first.id, third.id]);
        assert_eq!(result.unallocated_amount, 400);
    }

    #[tokio::test]
    async fn test_targeted_loan_is_settled_first() {
        let f = fixture().await;
        let older = active_loan(&f, RepaymentMethod::Fixed, 500, 500).await;
        let newer = active_loan(&f, RepaymentMethod::Fixed, 500, 500).await;
        let tx = incoming(&f, 500).await;

        let result = f
            .allocator
            .allocate_to(f.borrower.id, 500, tx, AllocationTarget::Loan(newer.id))
            .await
            .unwrap();

        assert_eq!(result.allocations.len(), 1);
        assert_eq!(result.allocations[0].loan_id, newer.id);
        let untouched = f.store.get_loan(older.id).await.unwrap().unwrap();
        assert_eq!(untouched.remaining_balance, 500);
    }

    #[tokio::test]
    async fn test_oldest_loans_are_settled_first() {
        let f = fixture().await;
        let first = active_loan(&f, RepaymentMethod::Fixed, 300, 300).await;
        let second = active_loan(&f, RepaymentMethod::Fixed, 300, 300).await;
        let third = active_loan(&f, RepaymentMethod::Fixed, 300, 300).await;
        let tx = incoming(&f, 600).await;

        let result = f.allocator.allocate(f.borrower.id, 600, tx).await.unwrap();

        let settled: Vec<Uuid> = result.allocations.iter().map(|a| a.loan_id).collect();
        assert_eq!(settled, vec![first.id, second.id]);
        assert_eq!(result.unallocated_amount, 0);
        for id in [first.id, second.id] {
            let loan = f.store.get_loan(id).await.unwrap().unwrap();
            assert_eq!(loan.status, LoanStatus::Completed);
        }
        let untouched = f.store.get_loan(third.id).await.unwrap().unwrap();
        assert_eq!(untouched.remaining_balance, 300);
        assert_eq!(untouched.status, LoanStatus::Active);
    }

    #[tokio::test]
    async fn test_amount_equal_to_threshold_is_allocated() {
        let f = fixture().await;
        active_loan(&f, RepaymentMethod::Fixed, 500, 4500).await;
        let tx = incoming(&f, DEFAULT_THRESHOLD).await;

        let result = f
            .allocator
            .allocate(f.borrower.id, DEFAULT_THRESHOLD, tx)
            .await
            .unwrap();

        assert!(!result.skipped_below_threshold);
        assert_eq!(result.total_allocated(), DEFAULT_THRESHOLD);
    }

    #[tokio::test]
    async fn test_huge_percentage_payment_is_capped_at_balance() {
        let f = fixture().await;
        let loan = active_loan(&f, RepaymentMethod::Percentage, 10, 4500).await;
        let tx = Uuid::new_v4();

        let result = f
            .allocator
            .allocate(f.borrower.id, i64::MAX / 5, tx)
            .await
            .unwrap();

        assert_eq!(result.allocations[0].deducted, 4500);
        assert_eq!(result.unallocated_amount, i64::MAX / 5 - 4500);
        let stored = f.store.get_loan(loan.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LoanStatus::Completed);
    }

    #[tokio::test]
    async fn test_stale_loan_is_reread_and_retried() {
        let f = fixture().await;
        let loan = active_loan(&f, RepaymentMethod::Fixed, 500, 4500).await;
        f.store.race_loan_writes(loan.id, 2).await;
        let tx = incoming(&f, 1000).await;

        let result = f.allocator.allocate(f.borrower.id, 1000, tx).await.unwrap();

        assert!(!result.is_partial());
        assert_eq!(result.allocations[0].deducted, 500);
        let stored = f.store.get_loan(loan.id).await.unwrap().unwrap();
        assert_eq!(stored.remaining_balance, 4000);
        // Two lost races plus the write that landed
        assert_eq!(stored.version, loan.version + 3);
        assert_eq!(f.store.repayments().await.len(), 1);
    }

    #[tokio::test]
    async fn test_loan_that_keeps_changing_is_reported_not_retried_forever() {
        let f = fixture().await;
        let busy = active_loan(&f, RepaymentMethod::Fixed, 500, 4500).await;
        let calm = active_loan(&f, RepaymentMethod::Fixed, 500, 4500).await;
        f.store.race_loan_writes(busy.id, MAX_VERSION_RETRIES).await;
        let tx = incoming(&f, 1000).await;

        let result = f.allocator.allocate(f.borrower.id, 1000, tx).await.unwrap();

        assert!(result.is_partial());
        assert_eq!(result.errors[0].loan_id, busy.id);
        assert!(result.errors[0].error.contains("kept changing"));
        assert_eq!(result.allocations.len(), 1);
        assert_eq!(result.allocations[0].loan_id, calm.id);
        let busy = f.store.get_loan(busy.id).await.unwrap().unwrap();
        assert_eq!(busy.remaining_balance, 4500);
    }

    #[tokio::test]
    async fn test_concurrent_payments_for_one_borrower_never_overdraw() {
        let f = fixture().await;
        let loan = active_loan(&f, RepaymentMethod::Fixed, 500, 3000).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let tx = incoming(&f, 1000).await;
            let allocator = f.allocator.clone();
            let borrower_id = f.borrower.id;
            handles.push(tokio::spawn(async move {
                allocator.allocate(borrower_id, 1000, tx).await
            }));
        }

        let mut deducted = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert!(!result.is_partial());
            deducted += result.total_allocated();
        }

        assert_eq!(deducted, 3000);
        let stored = f.store.get_loan(loan.id).await.unwrap().unwrap();
        assert_eq!(stored.remaining_balance, 0);
        assert_eq!(stored.status, LoanStatus::Completed);
        assert_eq!(f.store.repayments().await.len(), 6);
    }
}
