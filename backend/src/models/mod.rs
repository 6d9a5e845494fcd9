//! Data models for the ledger

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod phone;
pub use phone::PhoneNumber;

/// Largest single amount (in shillings) the ledger accepts for a payment,
/// loan principal or fixed repayment
pub const MAX_AMOUNT: i64 = 1_000_000_000_000;

/// User model. A user may be a borrower on some loans and a lender on others.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub phone_number: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    /// General wallet balance; unallocated incoming funds stay here
    pub wallet_balance: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Profile fields an offline client may change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserProfileUpdate {
    pub full_name: Option<String>,
    pub email: Option<String>,
}

impl UserProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none() && self.email.is_none()
    }
}

/// Direction of a money movement relative to the owning user
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "transaction_direction", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionDirection {
    Incoming,
    Outgoing,
}

/// Immutable record of money movement
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub direction: TransactionDirection,
    pub source_phone: Option<String>,
    pub description: Option<String>,
    /// Carrier receipt or originating queue item; unique when present
    pub external_reference: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape for a transaction
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub amount: i64,
    pub direction: TransactionDirection,
    pub source_phone: Option<String>,
    pub description: Option<String>,
    pub external_reference: Option<String>,
}

/// Notification categories
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "notification_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    LoanRequest,
    Approval,
    Repayment,
    LoanCompleted,
}

/// Informational message to a user. Never used for control flow.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub loan_id: Option<Uuid>,
    pub repayment_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub loan_id: Option<Uuid>,
    pub repayment_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub message: String,
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}
