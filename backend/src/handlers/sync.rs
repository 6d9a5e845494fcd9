//! Offline sync API handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::ApiError;
use crate::models::{ApiResponse, PhoneNumber};
use crate::sync::{
    ChangeRecord, FullSyncResult, SyncEngine, SyncEntityType, SyncOperation, SyncQueueItem,
    SyncResult, SyncStatus,
};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PhoneRequest {
    #[validate(length(min = 9, max = 16))]
    pub phone_number: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct QueueOperationRequest {
    #[validate(length(min = 9, max = 16))]
    pub phone_number: String,
    pub entity_type: SyncEntityType,
    pub operation: SyncOperation,
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    /// Milliseconds since the epoch; defaults to the stored checkpoint
    pub since: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterQuery {
    pub max_retries: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct DiscardQuery {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingItems {
    pub phone_number: PhoneNumber,
    pub pending_count: usize,
    pub items: Vec<SyncQueueItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFeed {
    pub phone_number: PhoneNumber,
    pub since: DateTime<Utc>,
    pub change_count: usize,
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterItems {
    pub max_retries: i32,
    pub dead_letter_count: usize,
    pub items: Vec<SyncQueueItem>,
}

/// Queue drain, change feed and checkpoint in one call
pub async fn full_sync(
    State(engine): State<SyncEngine>,
    Json(request): Json<PhoneRequest>,
) -> Result<Json<ApiResponse<FullSyncResult>>, ApiError> {
    request.validate()?;
    let phone = PhoneNumber::parse(&request.phone_number)?;

    let result = engine.full_sync(&phone).await;

    Ok(Json(ApiResponse {
        success: result.success,
        error: result.error.clone(),
        data: Some(result),
    }))
}

pub async fn process_queue(
    State(engine): State<SyncEngine>,
    Json(request): Json<PhoneRequest>,
) -> Result<Json<ApiResponse<SyncResult>>, ApiError> {
    request.validate()?;
    let phone = PhoneNumber::parse(&request.phone_number)?;

    let result = engine.process_queue(&phone).await?;
    Ok(Json(ApiResponse::ok(result)))
}

pub async fn pending_items(
    State(engine): State<SyncEngine>,
    Path(phone): Path<String>,
) -> Result<Json<ApiResponse<PendingItems>>, ApiError> {
    let phone = PhoneNumber::parse(&phone)?;
    let items = engine.queue().list_pending(&phone).await?;

    Ok(Json(ApiResponse::ok(PendingItems {
        phone_number: phone,
        pending_count: items.len(),
        items,
    })))
}

pub async fn changes(
    State(engine): State<SyncEngine>,
    Path(phone): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ApiResponse<ChangeFeed>>, ApiError> {
    let phone = PhoneNumber::parse(&phone)?;

    let since = match query.since {
        Some(millis) => DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| ApiError::BadRequest(format!("Invalid timestamp: {}", millis)))?,
        None => engine.incremental().get_checkpoint(&phone).await?,
    };

    let changes = engine.incremental().get_changes_since(&phone, since).await?;

    Ok(Json(ApiResponse::ok(ChangeFeed {
        phone_number: phone,
        since,
        change_count: changes.len(),
        changes,
    })))
}

/// Accepts a mutation made while the client was offline
pub async fn queue_operation(
    State(engine): State<SyncEngine>,
    Json(request): Json<QueueOperationRequest>,
) -> Result<Json<ApiResponse<SyncQueueItem>>, ApiError> {
    request.validate()?;
    let phone = PhoneNumber::parse(&request.phone_number)?;

    let item = engine
        .queue()
        .enqueue(request.entity_type, request.operation, request.data, &phone)
        .await?;

    Ok(Json(ApiResponse::ok(item)))
}

pub async fn dead_letter(
    State(engine): State<SyncEngine>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<ApiResponse<DeadLetterItems>>, ApiError> {
    let max_retries = query.max_retries.unwrap_or(engine.queue().max_retries());
    if max_retries < 1 {
        return Err(ApiError::BadRequest("maxRetries must be at least 1".to_string()));
    }

    let items = engine.queue().list_dead_letter(Some(max_retries)).await?;

    Ok(Json(ApiResponse::ok(DeadLetterItems {
        max_retries,
        dead_letter_count: items.len(),
        items,
    })))
}

pub async fn requeue_item(
    State(engine): State<SyncEngine>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<SyncQueueItem>>, ApiError> {
    let item = engine.queue().requeue(id).await?;
    Ok(Json(ApiResponse::ok(item)))
}

pub async fn discard_item(
    State(engine): State<SyncEngine>,
    Path(id): Path<Uuid>,
    Query(query): Query<DiscardQuery>,
) -> Result<Json<ApiResponse<SyncQueueItem>>, ApiError> {
    let reason = query.reason.unwrap_or_else(|| "operator discard".to_string());
    let item = engine.queue().discard(id, &reason).await?;
    Ok(Json(ApiResponse::ok(item)))
}

pub async fn sync_status(
    State(engine): State<SyncEngine>,
    Path(phone): Path<String>,
) -> Result<Json<ApiResponse<SyncStatus>>, ApiError> {
    let phone = PhoneNumber::parse(&phone)?;
    let status = engine.sync_status(&phone).await?;
    Ok(Json(ApiResponse::ok(status)))
}
