//! Notification route definitions

use axum::{routing::get, Router};

use crate::handlers::*;
use crate::state::AppState;

pub fn notification_routes() -> Router<AppState> {
    Router::new().route("/api/notifications/:phone", get(list_notifications))
}
