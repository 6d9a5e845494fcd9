//! Loan and repayment models
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::Validate;

use crate::error::LedgerError;
use crate::models::MAX_AMOUNT;

/// Loan status. Transitions only move forward:
/// `pending -> active -> completed` or `pending -> declined`.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "loan_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Pending,
    Active,
    Completed,
    Declined,
}

impl LoanStatus {
    pub fn can_transition_to(self, next: LoanStatus) -> bool {
        matches!(
            (self, next),
            (LoanStatus::Pending, LoanStatus::Active)
                | (LoanStatus::Pending, LoanStatus::Declined)
                | (LoanStatus::Active, LoanStatus::Completed)
        )
    }
}

/// How much of each incoming payment a loan claims
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "repayment_method", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RepaymentMethod {
    /// A fixed amount per payment
    Fixed,
    /// A whole percentage of each incoming payment
    Percentage,
}

/// Loan model
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct Loan {
    pub id: Uuid,
    pub borrower_id: Uuid,
    pub lender_id: Uuid,
    pub principal_amount: i64,
    pub remaining_balance: i64,
    pub repayment_method: RepaymentMethod,
    /// Amount per payment for `fixed`, whole percent for `percentage`
    pub repayment_value: i64,
    pub status: LoanStatus,
    /// Client-side reference the loan was created from, if any
    pub client_reference: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loan {
    /// Nominal amount this loan claims from a payment. Percentages are taken
    /// from the full incoming amount, not what is left after earlier loans.
    pub fn due_from(&self, incoming_amount: i64) -> i64 {
        match self.repayment_method {
            RepaymentMethod::Fixed => self.repayment_value,
            RepaymentMethod::Percentage => {
                let due = i128::from(incoming_amount) * i128::from(self.repayment_value) / 100;
                i64::try_from(due).unwrap_or(if due < 0 { i64::MIN } else { i64::MAX })
            }
        }
    }

    /// Status a loan lands in after its balance moves to `new_balance`
    pub fn status_after(&self, new_balance: i64) -> LoanStatus {
        if new_balance <= 0 && self.status == LoanStatus::Active {
            LoanStatus::Completed
        } else {
            self.status
        }
    }

    pub fn is_settleable(&self) -> bool {
        self.status == LoanStatus::Active && self.remaining_balance > 0
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.borrower_id == user_id || self.lender_id == user_id
    }
}

/// Insert shape for a loan
#[derive(Debug, Clone)]
pub struct NewLoan {
    pub borrower_id: Uuid,
    pub lender_id: Uuid,
    pub principal_amount: i64,
    pub repayment_method: RepaymentMethod,
    pub repayment_value: i64,
    pub client_reference: Option<String>,
}

impl NewLoan {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.principal_amount <= 0 {
            return Err(LedgerError::Validation(
                "Principal amount must be greater than 0".to_string(),
            ));
        }
        if self.principal_amount > MAX_AMOUNT {
            return Err(LedgerError::Validation(format!(
                "Principal amount must not exceed {}",
                MAX_AMOUNT
            )));
        }
        if self.borrower_id == self.lender_id {
            return Err(LedgerError::Validation(
                "Cannot request a loan from yourself".to_string(),
            ));
        }
        validate_repayment_terms(self.repayment_method, self.repayment_value)
    }
}

pub fn validate_repayment_terms(method: RepaymentMethod, value: i64) -> Result<(), LedgerError> {
    match method {
        RepaymentMethod::Fixed if value <= 0 => Err(LedgerError::Validation(
            "Fixed repayment amount must be greater than 0".to_string(),
        )),
        RepaymentMethod::Fixed if value > MAX_AMOUNT => Err(LedgerError::Validation(format!(
            "Fixed repayment amount must not exceed {}",
            MAX_AMOUNT
        ))),
        RepaymentMethod::Percentage if !(1..=100).contains(&value) => Err(
            LedgerError::Validation("Repayment percentage must be between 1 and 100".to_string()),
        ),
        _ => Ok(()),
    }
}

/// Version-checked write of a loan's mutable fields
#[derive(Debug, Clone)]
pub struct LoanUpdate {
    pub loan_id: Uuid,
    pub expected_version: i64,
    pub status: LoanStatus,
    pub repayment_method: RepaymentMethod,
    pub repayment_value: i64,
}

/// Repayment model: one transaction applied to one loan
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct Repayment {
    pub id: Uuid,
    pub loan_id: Uuid,
    pub transaction_id: Uuid,
    pub borrower_id: Uuid,
    pub lender_id: Uuid,
    pub amount_deducted: i64,
    pub remaining_balance_after: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One allocation step, applied atomically by the store: insert the repayment
/// (unique on transaction + loan) and move the loan from `expected_version`.
#[derive(Debug, Clone)]
pub struct RepaymentWrite {
    pub loan_id: Uuid,
    pub transaction_id: Uuid,
    pub expected_version: i64,
    pub amount_deducted: i64,
    pub new_balance: i64,
    pub new_status: LoanStatus,
}

/// Outcome of a [`RepaymentWrite`]
#[derive(Debug, Clone)]
pub enum RepaymentApplied {
    Applied { repayment: Repayment, loan: Loan },
    /// The (transaction, loan) pair was already settled
    Duplicate(Repayment),
    /// The loan moved past `expected_version`
    VersionConflict { current: Loan },
}

/// Request to create a new loan
#[derive(Debug, Deserialize, Validate)]
pub struct CreateLoanRequest {
    #[validate(length(min = 9, max = 16))]
    pub borrower_phone: String,
    #[validate(length(min = 9, max = 16))]
    pub lender_phone: String,
    #[validate(range(min = 1, max = 1000000000000))]
    pub principal_amount: i64,
    pub repayment_method: RepaymentMethod,
    #[validate(range(min = 1, max = 1000000000000))]
    pub repayment_value: i64,
}

/// Lender decision on a pending loan
#[derive(Debug, Deserialize, Validate)]
pub struct LoanDecisionRequest {
    #[validate(length(min = 9, max = 16))]
    pub lender_phone: String,
    pub approved: bool,
}
