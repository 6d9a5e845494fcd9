//! Incoming money: live transactions, carrier callbacks and collection
//! requests

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use super::gateway::CarrierGateway;
use super::model::{loan_reference, C2bAck, C2bConfirmation, GatewayReceipt};
use crate::allocation::{AllocationResult, AllocationTarget, RepaymentAllocator};
use crate::error::{LedgerError, LedgerResult};
use crate::loan::LoanStatus;
use crate::models::{NewTransaction, PhoneNumber, Transaction, TransactionDirection, MAX_AMOUNT};
use crate::store::LedgerStore;

/// A money movement to record against a user's wallet
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub phone: PhoneNumber,
    pub amount: i64,
    pub direction: TransactionDirection,
    pub source_phone: Option<String>,
    pub description: Option<String>,
    /// Idempotence key: carrier receipt or originating queue item
    pub external_reference: Option<String>,
    pub target: AllocationTarget,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedPayment {
    pub transaction: Transaction,
    /// False when the reference had already been recorded
    pub newly_recorded: bool,
    pub allocation: Option<AllocationResult>,
    pub allocation_error: Option<String>,
}

impl RecordedPayment {
    /// Allocation either failed outright or left a loan unsettled
    pub fn allocation_incomplete(&self) -> bool {
        self.allocation_error.is_some()
            || self.allocation.as_ref().map_or(false, |a| a.is_partial())
    }
}

#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn LedgerStore>,
    allocator: RepaymentAllocator,
    gateway: Option<Arc<dyn CarrierGateway>>,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        allocator: RepaymentAllocator,
        gateway: Option<Arc<dyn CarrierGateway>>,
    ) -> Self {
        Self {
            store,
            allocator,
            gateway,
        }
    }

    /// Records the transaction, then settles loans best-effort. Allocation
    /// errors are logged and reported in the result, never returned.
    pub async fn record_payment(&self, payment: PaymentRecord) -> LedgerResult<RecordedPayment> {
        if payment.amount <= 0 {
            return Err(LedgerError::Validation(
                "Amount must be greater than 0".to_string(),
            ));
        }
        if payment.amount > MAX_AMOUNT {
            return Err(LedgerError::Validation(format!(
                "Amount must not exceed {}",
                MAX_AMOUNT
            )));
        }

        let user = self
            .store
            .get_user_by_phone(&payment.phone)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("User with phone {}", payment.phone)))?;

        let new_tx = NewTransaction {
            user_id: user.id,
            amount: payment.amount,
            direction: payment.direction,
            source_phone: payment.source_phone.clone(),
            description: payment.description.clone(),
            external_reference: payment.external_reference.clone(),
        };

        let (transaction, newly_recorded) = match self.store.insert_transaction(new_tx).await {
            Ok(tx) => (tx, true),
            Err(LedgerError::Duplicate(_)) => {
                let reference = payment.external_reference.as_deref().unwrap_or_default();
                let existing = self
                    .store
                    .get_transaction_by_reference(reference)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::NotFound(format!("Transaction with reference {}", reference))
                    })?;
                tracing::info!(
                    reference = %reference,
                    transaction_id = %existing.id,
                    "Transaction already recorded, resuming allocation"
                );
                (existing, false)
            }
            Err(e) => return Err(e),
        };

        if transaction.user_id != user.id {
            return Err(LedgerError::Validation(format!(
                "Reference {} belongs to another user",
                payment.external_reference.unwrap_or_default()
            )));
        }

        let mut recorded = RecordedPayment {
            transaction,
            newly_recorded,
            allocation: None,
            allocation_error: None,
        };

        if recorded.transaction.direction != TransactionDirection::Incoming {
            return Ok(recorded);
        }

        match self
            .allocator
            .allocate_to(
                user.id,
                recorded.transaction.amount,
                recorded.transaction.id,
                payment.target,
            )
            .await
        {
            Ok(result) => recorded.allocation = Some(result),
            Err(e) => {
                tracing::error!(
                    transaction_id = %recorded.transaction.id,
                    phone = %payment.phone,
                    error = %e,
                    "Repayment allocation failed"
                );
                recorded.allocation_error = Some(e.to_string());
            }
        }

        Ok(recorded)
    }

    pub async fn record_incoming(
        &self,
        phone: PhoneNumber,
        amount: i64,
        source_phone: Option<String>,
        description: Option<String>,
        external_reference: Option<String>,
    ) -> LedgerResult<RecordedPayment> {
        self.record_payment(PaymentRecord {
            phone,
            amount,
            direction: TransactionDirection::Incoming,
            source_phone,
            description,
            external_reference,
            target: AllocationTarget::Borrower,
        })
        .await
    }

    /// Handles a C2B confirmation. Always answers the carrier; failures are
    /// reported through the result code.
    pub async fn handle_c2b_confirmation(&self, confirmation: C2bConfirmation) -> C2bAck {
        let phone = match PhoneNumber::parse(&confirmation.msisdn) {
            Ok(phone) => phone,
            Err(e) => {
                tracing::warn!(trans_id = %confirmation.trans_id, error = %e, "Rejected C2B confirmation");
                return C2bAck::rejected(e.to_string());
            }
        };

        let target = match confirmation.target_loan() {
            Some(loan_id) => AllocationTarget::Loan(loan_id),
            None => AllocationTarget::Borrower,
        };

        let payment = PaymentRecord {
            phone,
            amount: confirmation.amount,
            direction: TransactionDirection::Incoming,
            source_phone: Some(confirmation.msisdn.clone()),
            description: Some(match &confirmation.bill_ref_number {
                Some(reference) => format!("M-PESA payment {}", reference),
                None => "M-PESA payment".to_string(),
            }),
            external_reference: Some(confirmation.trans_id.clone()),
            target,
        };

        match self.record_payment(payment).await {
            Ok(recorded) => {
                tracing::info!(
                    trans_id = %confirmation.trans_id,
                    transaction_id = %recorded.transaction.id,
                    new = recorded.newly_recorded,
                    "C2B confirmation processed"
                );
                C2bAck::accepted()
            }
            Err(e) => {
                tracing::error!(trans_id = %confirmation.trans_id, error = %e, "C2B confirmation failed");
                C2bAck::rejected(e.to_string())
            }
        }
    }

    /// Prompts the borrower of an active loan to pay through STK push
    pub async fn request_collection(
        &self,
        loan_id: Uuid,
        amount: Option<i64>,
    ) -> LedgerResult<GatewayReceipt> {
        let gateway = self.gateway.as_ref().ok_or_else(|| {
            LedgerError::Transient("Carrier gateway is not configured".to_string())
        })?;

        let loan = self
            .store
            .get_loan(loan_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Loan {}", loan_id)))?;
        if loan.status != LoanStatus::Active {
            return Err(LedgerError::Validation(format!(
                "Loan {} is not active",
                loan_id
            )));
        }

        let amount = amount.unwrap_or(loan.remaining_balance);
        if amount <= 0 || amount > loan.remaining_balance {
            return Err(LedgerError::Validation(format!(
                "Amount must be between 1 and {}",
                loan.remaining_balance
            )));
        }

        let borrower = self
            .store
            .get_user(loan.borrower_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("User {}", loan.borrower_id)))?;
        let phone = PhoneNumber::parse(&borrower.phone_number)?;

        gateway
            .initiate_collection(&phone, amount, &loan_reference(loan.id), "Loan repayment")
            .await
            .map_err(|e| LedgerError::Transient(format!("{:#}", e)))
    }
}
