//! Transaction route definitions

use axum::{routing::post, Router};

use crate::handlers::*;
use crate::state::AppState;

pub fn transaction_routes() -> Router<AppState> {
    Router::new().route("/api/transactions/incoming", post(record_incoming))
}
