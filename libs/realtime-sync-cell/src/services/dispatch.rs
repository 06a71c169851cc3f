use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{NormalizeError, RealtimeError};
use crate::models::{Event, EventKind, SosTriggerRequest, SourceChannel, SOS_BROADCAST_CHANNEL};
use crate::services::normalize::event_from_row;
use crate::services::transport::{BroadcastBus, WriteApi};

/// Sender side of an SOS alert: the authoritative row first, then a
/// best-effort broadcast so listening clinicians see it without waiting for
/// the change feed.
pub struct SosDispatcher {
    write: Arc<dyn WriteApi>,
    broadcast: Option<Arc<dyn BroadcastBus>>,
}

impl SosDispatcher {
    pub fn new(write: Arc<dyn WriteApi>, broadcast: Option<Arc<dyn BroadcastBus>>) -> Self {
        Self { write, broadcast }
    }

    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn trigger(&self, request: &SosTriggerRequest) -> Result<Event, RealtimeError> {
        validate(request)?;

        let temp_id = format!("temp-{}", Uuid::new_v4());
        let fields = json!({
            "user_id": request.user_id,
            "user_name": request.display_name(),
            "latitude": request.latitude,
            "longitude": request.longitude,
            "address": request.address,
            "emergency_type": request.emergency_type(),
            "status": "active",
        });

        let row = self.write
            .insert(EventKind::Sos.table(), fields)
            .await
            .map_err(|e| {
                error!("Failed to store SOS alert: {}", e);
                RealtimeError::WriteFailure { local_id: temp_id.clone(), reason: e.to_string() }
            })?;

        let event = event_from_row(EventKind::Sos, &row, SourceChannel::Optimistic)?;
        info!("SOS alert {} stored for {}", event.display_id(), request.user_id);

        if let Some(bus) = &self.broadcast {
            let payload = json!({
                "event": "sos",
                "id": temp_id,
                "user_id": request.user_id,
                "user_name": request.display_name(),
                "latitude": request.latitude,
                "longitude": request.longitude,
                "address": request.address,
                "emergency_type": request.emergency_type(),
                "created_at": event.created_at.to_rfc3339(),
            });
            if let Err(e) = bus.send(SOS_BROADCAST_CHANNEL, payload).await {
                warn!("SOS broadcast for {} failed, relying on change feed: {}", event.display_id(), e);
            }
        }

        Ok(event)
    }
}

fn validate(request: &SosTriggerRequest) -> Result<(), NormalizeError> {
    if request.user_id.trim().is_empty() {
        return Err(NormalizeError::MissingField {
            source_name: "sos request".to_string(),
            field: "user_id".to_string(),
        });
    }
    check_coordinate("latitude", request.latitude, 90.0)?;
    check_coordinate("longitude", request.longitude, 180.0)
}

fn check_coordinate(field: &str, value: f64, limit: f64) -> Result<(), NormalizeError> {
    if value.is_finite() && value.abs() <= limit {
        return Ok(());
    }
    Err(NormalizeError::InvalidField {
        field: field.to_string(),
        reason: format!("{} is outside ±{}", Value::from(value), limit),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(latitude: f64) -> SosTriggerRequest {
        SosTriggerRequest {
            user_id: "patient-1".into(),
            user_name: None,
            latitude,
            longitude: 3.38,
            address: None,
            emergency_type: None,
        }
    }

    #[test]
    fn coordinates_are_range_checked() {
        assert!(validate(&request(6.5)).is_ok());
        assert!(validate(&request(91.0)).is_err());
        assert!(validate(&request(f64::NAN)).is_err());
    }

    #[test]
    fn user_is_required() {
        let mut req = request(6.5);
        req.user_id = " ".into();
        assert!(matches!(validate(&req), Err(NormalizeError::MissingField { .. })));
    }
}
