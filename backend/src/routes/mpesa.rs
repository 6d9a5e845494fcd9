//! Carrier route definitions

use axum::{routing::post, Router};

use crate::handlers::*;
use crate::state::AppState;

pub fn mpesa_routes() -> Router<AppState> {
    Router::new()
        .route("/api/mpesa/c2b/confirmation", post(c2b_confirmation))
        .route("/api/mpesa/stk-push", post(stk_push))
}
