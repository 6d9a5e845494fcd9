//! Sync route definitions

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::handlers::*;
use crate::state::AppState;

pub fn sync_routes() -> Router<AppState> {
    Router::new()
        .route("/api/sync/full", post(full_sync))
        .route("/api/sync/queue", post(process_queue))
        .route("/api/sync/pending/:phone", get(pending_items))
        .route("/api/sync/changes/:phone", get(changes))
        .route("/api/sync/queue-operation", post(queue_operation))
        .route("/api/sync/dead-letter", get(dead_letter))
        .route("/api/sync/dead-letter/:id/requeue", post(requeue_item))
        .route("/api/sync/dead-letter/:id", delete(discard_item))
        .route("/api/sync/status/:phone", get(sync_status))
}
