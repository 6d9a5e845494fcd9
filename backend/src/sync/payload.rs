//! Typed queue payloads
//!
//! Queue rows keep the payload as raw JSON. It is decoded into a
//! [`QueuedMutation`] twice: once at enqueue time, so malformed input is
//! rejected before it is ever queued, and again at dequeue time.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::model::{SyncEntityType, SyncOperation};
use crate::error::{LedgerError, LedgerResult};
use crate::loan::{validate_repayment_terms, LoanStatus, RepaymentMethod};
use crate::models::{PhoneNumber, TransactionDirection};

#[derive(Debug, Clone, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoanCreatePayload {
    pub borrower_phone: PhoneNumber,
    pub lender_phone: PhoneNumber,
    #[validate(range(min = 1, max = 1000000000000))]
    pub principal_amount: i64,
    pub repayment_method: RepaymentMethod,
    pub repayment_value: i64,
}

#[derive(Debug, Clone, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoanUpdatePayload {
    pub loan_id: Uuid,
    /// Server version the client last saw
    #[validate(range(min = 1))]
    pub version: i64,
    pub edited_at: Option<DateTime<Utc>>,
    pub status: Option<LoanStatus>,
    pub repayment_method: Option<RepaymentMethod>,
    pub repayment_value: Option<i64>,
    /// Never applied; balances only move through repayments
    pub remaining_balance: Option<i64>,
}

fn default_direction() -> TransactionDirection {
    TransactionDirection::Incoming
}

#[derive(Debug, Clone, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCreatePayload {
    #[validate(range(min = 1, max = 1000000000000))]
    pub amount: i64,
    #[serde(default = "default_direction")]
    pub direction: TransactionDirection,
    pub source_phone: Option<PhoneNumber>,
    #[validate(length(max = 255))]
    pub description: Option<String>,
    /// Carrier receipt, when the client has one
    #[validate(length(min = 1, max = 64))]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepaymentCreatePayload {
    pub transaction_id: Uuid,
    /// Loan to settle first, if the client picked one
    pub loan_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdatePayload {
    #[validate(range(min = 1))]
    pub version: i64,
    pub edited_at: Option<DateTime<Utc>>,
    #[validate(length(min = 1, max = 100))]
    pub full_name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    /// Never applied; the server owns wallet balances
    pub wallet_balance: Option<i64>,
}

/// A decoded queue payload, tagged by entity type and operation
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedMutation {
    CreateLoan(LoanCreatePayload),
    UpdateLoan(LoanUpdatePayload),
    CreateTransaction(TransactionCreatePayload),
    CreateRepayment(RepaymentCreatePayload),
    UpdateUser(UserUpdatePayload),
}

impl QueuedMutation {
    pub fn decode(
        entity_type: SyncEntityType,
        operation: SyncOperation,
        payload: &serde_json::Value,
    ) -> LedgerResult<Self> {
        let mutation = match (entity_type, operation) {
            (SyncEntityType::Loan, SyncOperation::Create) => {
                let p: LoanCreatePayload = serde_json::from_value(payload.clone())?;
                p.validate()?;
                validate_repayment_terms(p.repayment_method, p.repayment_value)?;
                if p.borrower_phone == p.lender_phone {
                    return Err(LedgerError::Validation(
                        "Cannot request a loan from yourself".to_string(),
                    ));
                }
                QueuedMutation::CreateLoan(p)
            }
            (SyncEntityType::Loan, SyncOperation::Update) => {
                let p: LoanUpdatePayload = serde_json::from_value(payload.clone())?;
                p.validate()?;
                if let (Some(method), Some(value)) = (p.repayment_method, p.repayment_value) {
                    validate_repayment_terms(method, value)?;
                }
                if p.status.is_none()
                    && p.repayment_method.is_none()
                    && p.repayment_value.is_none()
                    && p.remaining_balance.is_none()
                {
                    return Err(LedgerError::Validation(
                        "Loan update changes nothing".to_string(),
                    ));
                }
                QueuedMutation::UpdateLoan(p)
            }
            (SyncEntityType::Transaction, SyncOperation::Create) => {
                let p: TransactionCreatePayload = serde_json::from_value(payload.clone())?;
                p.validate()?;
                QueuedMutation::CreateTransaction(p)
            }
            (SyncEntityType::Repayment, SyncOperation::Create) => {
                let p: RepaymentCreatePayload = serde_json::from_value(payload.clone())?;
                QueuedMutation::CreateRepayment(p)
            }
            (SyncEntityType::User, SyncOperation::Update) => {
                let p: UserUpdatePayload = serde_json::from_value(payload.clone())?;
                p.validate()?;
                QueuedMutation::UpdateUser(p)
            }
            (entity, op) => {
                return Err(LedgerError::Validation(format!(
                    "Unsupported operation {:?} on {}",
                    op,
                    entity.as_str()
                )))
            }
        };
        Ok(mutation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_loan_create_normalises_phones() {
        let mutation = QueuedMutation::decode(
            SyncEntityType::Loan,
            SyncOperation::Create,
            &json!({
                "borrowerPhone": "0712345678",
                "lenderPhone": "+254722000111",
                "principalAmount": 5000,
                "repaymentMethod": "fixed",
                "repaymentValue": 500
            }),
        )
        .unwrap();

        match mutation {
            QueuedMutation::CreateLoan(p) => {
                assert_eq!(p.borrower_phone.as_str(), "254712345678");
                assert_eq!(p.lender_phone.as_str(), "254722000111");
            }
            other => panic!("unexpected mutation {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_invalid_payloads() {
        let cases = [
            (
                SyncEntityType::Loan,
                SyncOperation::Create,
                json!({
                    "borrowerPhone": "0712345678",
                    "lenderPhone": "0712345678",
                    "principalAmount": 5000,
                    "repaymentMethod": "fixed",
                    "repaymentValue": 500
                }),
            ),
            (
                SyncEntityType::Loan,
                SyncOperation::Create,
                json!({
                    "borrowerPhone": "0712345678",
                    "lenderPhone": "0722000111",
                    "principalAmount": 5000,
                    "repaymentMethod": "percentage",
                    "repaymentValue": 120
                }),
            ),
            (
                SyncEntityType::Transaction,
                SyncOperation::Create,
                json!({ "amount": 0 }),
            ),
            (
                SyncEntityType::Transaction,
                SyncOperation::Create,
                json!({ "amount": i64::MAX / 5 }),
            ),
            (
                SyncEntityType::User,
                SyncOperation::Update,
                json!({ "version": 1, "email": "not-an-email" }),
            ),
            (
                SyncEntityType::Loan,
                SyncOperation::Update,
                json!({ "loanId": Uuid::new_v4(), "version": 2 }),
            ),
            (
                SyncEntityType::Transaction,
                SyncOperation::Update,
                json!({ "amount": 100 }),
            ),
            (
                SyncEntityType::Repayment,
                SyncOperation::Create,
                json!({ "transactionId": "not-a-uuid" }),
            ),
        ];

        for (entity, op, payload) in cases {
            let err = QueuedMutation::decode(entity, op, &payload).unwrap_err();
            assert!(
                matches!(err, LedgerError::Validation(_)),
                "{} should be rejected as validation, got {:?}",
                payload,
                err
            );
        }
    }

    #[test]
    fn test_transaction_direction_defaults_to_incoming() {
        let mutation = QueuedMutation::decode(
            SyncEntityType::Transaction,
            SyncOperation::Create,
            &json!({ "amount": 1000, "reference": "QK7X1" }),
        )
        .unwrap();

        assert_eq!(
            mutation,
            QueuedMutation::CreateTransaction(TransactionCreatePayload {
                amount: 1000,
                direction: TransactionDirection::Incoming,
                source_phone: None,
                description: None,
                reference: Some("QK7X1".to_string()),
            })
        );
    }
}
