//! Notification API handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, LedgerError};
use crate::models::{ApiResponse, Notification, PhoneNumber};
use crate::store::LedgerStore;

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationList {
    pub phone_number: PhoneNumber,
    pub unread_count: usize,
    pub notifications: Vec<Notification>,
}

/// Latest repayment and loan messages for a phone, newest first
pub async fn list_notifications(
    State(store): State<Arc<dyn LedgerStore>>,
    Path(phone): Path<String>,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<ApiResponse<NotificationList>>, ApiError> {
    let phone = PhoneNumber::parse(&phone)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }

    let user = store
        .get_user_by_phone(&phone)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("User with phone {}", phone)))?;
    let notifications = store.notifications_for_user(user.id, limit).await?;

    Ok(Json(ApiResponse::ok(NotificationList {
        phone_number: phone,
        unread_count: notifications.iter().filter(|n| !n.read).count(),
        notifications,
    })))
}
