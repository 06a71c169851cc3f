use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use realtime_sync_cell::handlers::RealtimeState;
use realtime_sync_cell::router::create_realtime_router;

pub fn create_router(state: Arc<RealtimeState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Amae realtime API is running!" }))
        .nest("/realtime", create_realtime_router(state))
}
