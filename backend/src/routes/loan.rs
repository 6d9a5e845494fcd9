//! Loan route definitions

use axum::{
    routing::{patch, post},
    Router,
};

use crate::handlers::*;
use crate::state::AppState;

pub fn loan_routes() -> Router<AppState> {
    Router::new()
        .route("/api/loans/request", post(request_loan))
        .route("/api/loans/:id/approval", patch(decide_loan))
}
