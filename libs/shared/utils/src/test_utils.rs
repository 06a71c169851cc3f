use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;

pub struct TestConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_token: String,
    pub redis_url: Option<String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            supabase_service_token: "test-service-token".to_string(),
            redis_url: None,
        }
    }
}

impl TestConfig {
    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_service_token: self.supabase_service_token.clone(),
            redis_url: self.redis_url.clone(),
            // Short intervals keep realtime tests fast.
            sos_poll_interval_ms: 200,
            degraded_poll_interval_ms: 50,
            push_grace_period_ms: 100,
            sos_recency_window_secs: 60,
            optimistic_timeout_ms: 500,
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestUser {
    pub id: String,
    pub name: String,
    pub role: String,
}

impl TestUser {
    pub fn new(name: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            role: role.to_string(),
        }
    }

    pub fn patient(name: &str) -> Self {
        Self::new(name, "patient")
    }

    pub fn doctor(name: &str) -> Self {
        Self::new(name, "doctor")
    }
}

/// A `sos_events` row as the database stores it.
pub fn sos_row(id: &str, user: &TestUser, created_at: DateTime<Utc>) -> Value {
    json!({
        "id": id,
        "user_id": user.id,
        "user_name": user.name,
        "latitude": 6.5244,
        "longitude": 3.3792,
        "address": null,
        "emergency_type": "Medical Emergency",
        "status": "active",
        "created_at": created_at.to_rfc3339(),
    })
}

/// A `chat_messages` row as the database stores it.
pub fn chat_row(id: &str, consultation_id: &str, sender: &TestUser, message: &str, created_at: DateTime<Utc>) -> Value {
    json!({
        "id": id,
        "consultation_id": consultation_id,
        "sender_id": sender.id,
        "message": message,
        "created_at": created_at.to_rfc3339(),
    })
}

/// The low-latency copy a patient's client broadcasts next to the SOS insert.
/// The side-channel copy as the patient portal sends it: no `user_id`.
pub fn portal_sos_broadcast(temp_id: &str, user: &TestUser, created_at: DateTime<Utc>) -> Value {
    json!({
        "id": temp_id,
        "user_name": user.name,
        "latitude": 6.5244,
        "longitude": 3.3792,
        "emergency_type": "Medical Emergency",
        "created_at": created_at.to_rfc3339(),
    })
}

pub fn sos_broadcast(temp_id: &str, user: &TestUser, created_at: DateTime<Utc>) -> Value {
    json!({
        "id": temp_id,
        "user_id": user.id,
        "user_name": user.name,
        "latitude": 6.5244,
        "longitude": 3.3792,
        "emergency_type": "Medical Emergency",
        "created_at": created_at.to_rfc3339(),
    })
}
