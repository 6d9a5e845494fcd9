//! Transaction API handlers

use axum::{extract::State, Json};
use validator::Validate;

use crate::error::ApiError;
use crate::models::{ApiResponse, PhoneNumber};
use crate::payments::{IncomingTransactionRequest, PaymentService, RecordedPayment};

/// Records money received by a user and settles what it can of their loans.
/// Allocation problems come back in the body; the payment itself stands.
pub async fn record_incoming(
    State(service): State<PaymentService>,
    Json(request): Json<IncomingTransactionRequest>,
) -> Result<Json<ApiResponse<RecordedPayment>>, ApiError> {
    request.validate()?;
    let phone = PhoneNumber::parse(&request.phone)?;

    let recorded = service
        .record_incoming(
            phone,
            request.amount,
            request.source_phone,
            request.description,
            request.reference,
        )
        .await?;

    Ok(Json(ApiResponse::ok(recorded)))
}
