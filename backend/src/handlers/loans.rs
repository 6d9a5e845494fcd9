//! Loan API handlers

use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;
use validator::Validate;

use crate::error::ApiError;
use crate::loan::{CreateLoanRequest, Loan, LoanDecisionRequest};
use crate::loan_service::{LoanRequest, LoanService};
use crate::models::{ApiResponse, PhoneNumber};

pub async fn request_loan(
    State(service): State<LoanService>,
    Json(request): Json<CreateLoanRequest>,
) -> Result<Json<ApiResponse<Loan>>, ApiError> {
    request.validate()?;

    let loan = service
        .request_loan(LoanRequest {
            borrower_phone: PhoneNumber::parse(&request.borrower_phone)?,
            lender_phone: PhoneNumber::parse(&request.lender_phone)?,
            principal_amount: request.principal_amount,
            repayment_method: request.repayment_method,
            repayment_value: request.repayment_value,
            client_reference: None,
        })
        .await?;

    Ok(Json(ApiResponse::ok(loan)))
}

pub async fn decide_loan(
    State(service): State<LoanService>,
    Path(loan_id): Path<Uuid>,
    Json(request): Json<LoanDecisionRequest>,
) -> Result<Json<ApiResponse<Loan>>, ApiError> {
    request.validate()?;
    let lender = PhoneNumber::parse(&request.lender_phone)?;

    let loan = service.decide_loan(loan_id, &lender, request.approved).await?;
    Ok(Json(ApiResponse::ok(loan)))
}
