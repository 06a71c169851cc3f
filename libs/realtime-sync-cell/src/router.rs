use std::sync::Arc;
use axum::{
    Router,
    routing::{get, post},
};

use crate::handlers::{
    get_health,
    stream_alerts,
    trigger_sos,
    resolve_alert,
    RealtimeState,
};

pub fn create_realtime_router(state: Arc<RealtimeState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/alerts/stream", get(stream_alerts))
        .route("/sos", post(trigger_sos))
        .route("/alerts/{alert_id}/resolve", post(resolve_alert))
        .with_state(state)
}
