use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::Json,
};
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use shared_config::AppConfig;
use shared_models::error::AppError;

use crate::error::RealtimeError;
use crate::models::{RealtimeConfig, SosTriggerRequest};
use crate::services::dispatch::SosDispatcher;
use crate::services::hub::NotificationHub;
use crate::services::session::{RealtimeSession, SessionScope};
use crate::services::transport::RealtimeBackends;

pub const ALERTS_CHANNEL: &str = "sos-alerts";

/// Everything the HTTP surface shares: one SOS alert session relayed into a
/// hub, plus the dispatcher used by patients raising alerts.
pub struct RealtimeState {
    pub config: Arc<AppConfig>,
    pub alerts: Arc<RealtimeSession>,
    pub hub: Arc<NotificationHub>,
    pub dispatcher: Arc<SosDispatcher>,
}

impl RealtimeState {
    pub fn from_config(config: Arc<AppConfig>) -> Result<Self, RealtimeError> {
        let backends = RealtimeBackends::from_config(&config)?;
        Ok(Self::new(config, &backends))
    }

    /// Must be called inside a Tokio runtime.
    pub fn new(config: Arc<AppConfig>, backends: &RealtimeBackends) -> Self {
        let (alerts, receiver) = RealtimeSession::start(
            SessionScope::SosAlerts,
            backends,
            RealtimeConfig::sos_alerts(&config),
        );

        let hub = Arc::new(NotificationHub::new());
        hub.clone().relay(ALERTS_CHANNEL, receiver);

        Self {
            config,
            alerts: Arc::new(alerts),
            hub,
            dispatcher: Arc::new(SosDispatcher::new(backends.write.clone(), backends.broadcast.clone())),
        }
    }
}

pub async fn get_health(State(state): State<Arc<RealtimeState>>) -> Json<Value> {
    let health = state.alerts.current_health();

    Json(json!({
        "status": if health.push_ok { "healthy" } else { "degraded" },
        "push_ok": health.push_ok,
        "poll_interval_ms": health.poll_interval_ms,
        "latency_bound_ms": health.latency_bound_ms,
        "supabase_configured": state.config.is_configured(),
        "redis_configured": state.config.is_redis_configured(),
        "active_channels": state.hub.get_active_channels().await,
    }))
}

/// Server-Sent Events stream of alert notifications (`insert`, `upgrade`, `error`).
pub async fn stream_alerts(
    State(state): State<Arc<RealtimeState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    info!("New SOS alert stream listener");
    let receiver = state.hub.subscribe(ALERTS_CHANNEL).await;

    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(message) => return Some((Ok(SseEvent::default().event("notification").data(message)), receiver)),
                Err(RecvError::Lagged(skipped)) => warn!("Alert stream listener lagged, {} messages skipped", skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn trigger_sos(
    State(state): State<Arc<RealtimeState>>,
    Json(request): Json<SosTriggerRequest>,
) -> Result<Json<Value>, AppError> {
    info!("SOS triggered by user: {}", request.user_id);

    let event = state.dispatcher.trigger(&request).await.map_err(|e| {
        error!("Failed to dispatch SOS alert: {}", e);
        AppError::from(e)
    })?;

    Ok(Json(json!({
        "success": true,
        "alert": event,
    })))
}

pub async fn resolve_alert(
    State(state): State<Arc<RealtimeState>>,
    Path(alert_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    info!("Resolving SOS alert: {}", alert_id);

    state.alerts.resolve(&alert_id).await.map_err(|e| {
        error!("Failed to resolve SOS alert {}: {}", alert_id, e);
        AppError::from(e)
    })?;

    Ok(Json(json!({
        "success": true,
        "alert_id": alert_id,
        "status": "resolved",
    })))
}
