//! Carrier callback and payment prompt handlers

use axum::{extract::State, Json};
use validator::Validate;

use crate::error::ApiError;
use crate::models::ApiResponse;
use crate::payments::{C2bAck, C2bConfirmation, GatewayReceipt, PaymentService, StkPushRequest};

/// The carrier only reads `ResultCode`, so this always answers 200
pub async fn c2b_confirmation(
    State(service): State<PaymentService>,
    Json(confirmation): Json<C2bConfirmation>,
) -> Json<C2bAck> {
    Json(service.handle_c2b_confirmation(confirmation).await)
}

pub async fn stk_push(
    State(service): State<PaymentService>,
    Json(request): Json<StkPushRequest>,
) -> Result<Json<ApiResponse<GatewayReceipt>>, ApiError> {
    request.validate()?;
    let receipt = service
        .request_collection(request.loan_id, request.amount)
        .await?;
    Ok(Json(ApiResponse::ok(receipt)))
}
