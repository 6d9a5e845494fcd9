//! Sync queue, change feed and audit models

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::PhoneNumber;

/// Entity a queued mutation targets
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Hash)]
#[sqlx(type_name = "sync_entity_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SyncEntityType {
    Loan,
    Transaction,
    Repayment,
    User,
}

impl SyncEntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEntityType::Loan => "loan",
            SyncEntityType::Transaction => "transaction",
            SyncEntityType::Repayment => "repayment",
            SyncEntityType::User => "user",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Hash)]
#[sqlx(type_name = "sync_operation", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncOperation {
    Create,
    Update,
}

/// A mutation originated while the client could not reach the ledger.
///
/// The payload is stored exactly as queued; only the status columns change
/// after insertion.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct SyncQueueItem {
    pub id: Uuid,
    /// Insertion order; breaks ties between equal `created_at` values
    pub sequence: i64,
    pub entity_type: SyncEntityType,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
    pub owner_phone: String,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Derived lifecycle state of a queue item
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemState {
    Pending,
    Synced,
    /// Still pending underneath; needs an operator
    DeadLetter,
}

impl SyncQueueItem {
    pub fn state(&self, max_retries: i32) -> QueueItemState {
        if self.synced {
            QueueItemState::Synced
        } else if self.retry_count >= max_retries {
            QueueItemState::DeadLetter
        } else {
            QueueItemState::Pending
        }
    }
}

/// Insert shape for a queue item
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub entity_type: SyncEntityType,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
    pub owner_phone: PhoneNumber,
}

/// Entity kinds surfaced by the change feed
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangedEntity {
    Loan,
    Transaction,
    Repayment,
}

/// One ledger record changed after a client's checkpoint
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChangeRecord {
    pub entity_type: ChangedEntity,
    pub id: Uuid,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    /// Full record for client hydration
    pub data: serde_json::Value,
}

/// Audit entry written for every conflict resolution or manual intervention
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct ResolutionRecord {
    pub id: Uuid,
    pub queue_item_id: Option<Uuid>,
    pub entity_type: SyncEntityType,
    pub entity_id: Option<String>,
    pub strategy: String,
    pub winner: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewResolutionRecord {
    pub queue_item_id: Option<Uuid>,
    pub entity_type: SyncEntityType,
    pub entity_id: Option<String>,
    pub strategy: String,
    pub winner: String,
    pub reason: String,
}
