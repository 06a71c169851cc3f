use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use shared_config::AppConfig;

// =====================================================================================
// EVENT ENVELOPE
// =====================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Sos,
    ChatMessage,
}

impl EventKind {
    pub fn table(&self) -> &'static str {
        match self {
            EventKind::Sos => "sos_events",
            EventKind::ChatMessage => "chat_messages",
        }
    }

    /// Payload fields that carry user-authored content. Server-assigned values
    /// (ids, timestamps, status) never take part in content matching.
    pub fn content_fields(&self) -> &'static [&'static str] {
        match self {
            EventKind::Sos => &["latitude", "longitude", "emergency_type"],
            EventKind::ChatMessage => &["message"],
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Sos => write!(f, "sos"),
            EventKind::ChatMessage => write!(f, "chat_message"),
        }
    }
}

/// Where an envelope came from. Kept for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceChannel {
    Push,
    Broadcast,
    Poll,
    Optimistic,
}

impl fmt::Display for SourceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceChannel::Push => write!(f, "push"),
            SourceChannel::Broadcast => write!(f, "broadcast"),
            SourceChannel::Poll => write!(f, "poll"),
            SourceChannel::Optimistic => write!(f, "optimistic"),
        }
    }
}

/// Identity of an envelope. A provisional key never equals a logical key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Key {
    Logical { kind: EventKind, id: String },
    Provisional { kind: EventKind, local_id: String },
}

impl Key {
    pub fn logical(kind: EventKind, id: &str) -> Self {
        Key::Logical { kind, id: id.to_string() }
    }

    pub fn provisional(kind: EventKind, local_id: &str) -> Self {
        Key::Provisional { kind, local_id: local_id.to_string() }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Key::Logical { kind, .. } | Key::Provisional { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Key::Logical { id, .. } => id,
            Key::Provisional { local_id, .. } => local_id,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Key::Provisional { .. })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Logical { kind, id } => write!(f, "{}:{}", kind, id),
            Key::Provisional { kind, local_id } => write!(f, "{}:~{}", kind, local_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Server-assigned id, once known.
    pub logical_id: Option<String>,
    /// Client-generated placeholder, present before the server id exists.
    pub local_id: Option<String>,
    pub kind: EventKind,
    pub origin_id: String,
    pub payload: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub source_channel: SourceChannel,
}

impl Event {
    pub fn confirmed(
        logical_id: impl Into<String>,
        kind: EventKind,
        origin_id: impl Into<String>,
        payload: Map<String, Value>,
        created_at: DateTime<Utc>,
        source_channel: SourceChannel,
    ) -> Self {
        Self {
            logical_id: Some(logical_id.into()),
            local_id: None,
            kind,
            origin_id: origin_id.into(),
            payload,
            created_at,
            source_channel,
        }
    }

    pub fn provisional(
        local_id: impl Into<String>,
        kind: EventKind,
        origin_id: impl Into<String>,
        payload: Map<String, Value>,
        created_at: DateTime<Utc>,
        source_channel: SourceChannel,
    ) -> Self {
        Self {
            logical_id: None,
            local_id: Some(local_id.into()),
            kind,
            origin_id: origin_id.into(),
            payload,
            created_at,
            source_channel,
        }
    }

    /// Low-trust copies (optimistic sends, broadcast side-channel) have no server id.
    pub fn is_provisional(&self) -> bool {
        self.logical_id.is_none()
    }

    pub fn display_id(&self) -> &str {
        self.logical_id
            .as_deref()
            .or(self.local_id.as_deref())
            .unwrap_or_default()
    }

    pub fn text(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }
}

// =====================================================================================
// CONSUMER-FACING NOTIFICATIONS
// =====================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Insert,
    Upgrade,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A logical event the consumer has not rendered yet.
    Insert { event: Event },
    /// The entry rendered under `replaced` is now `event`; same UI slot.
    Upgrade { replaced: Key, event: Event },
    /// A locally originated send that will never be confirmed.
    Error { local_id: String, event: Event, reason: String },
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::Insert { .. } => NotificationKind::Insert,
            Notification::Upgrade { .. } => NotificationKind::Upgrade,
            Notification::Error { .. } => NotificationKind::Error,
        }
    }

    pub fn event(&self) -> &Event {
        match self {
            Notification::Insert { event }
            | Notification::Upgrade { event, .. }
            | Notification::Error { event, .. } => event,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentHealth {
    pub push_ok: bool,
    /// `None` while the poll adapter is dormant.
    pub poll_interval_ms: Option<u64>,
    pub latency_bound_ms: u64,
}

// =====================================================================================
// SOS DISPATCH
// =====================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SosTriggerRequest {
    pub user_id: String,
    pub user_name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub emergency_type: Option<String>,
}

impl SosTriggerRequest {
    pub fn emergency_type(&self) -> &str {
        self.emergency_type.as_deref().unwrap_or(DEFAULT_EMERGENCY_TYPE)
    }

    pub fn display_name(&self) -> &str {
        self.user_name.as_deref().unwrap_or("Unknown User")
    }
}

pub const DEFAULT_EMERGENCY_TYPE: &str = "Medical Emergency";
pub const SOS_BROADCAST_CHANNEL: &str = "sos_alerts";

// =====================================================================================
// CONFIGURATION
// =====================================================================================

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Poll cadence while push is healthy; `None` keeps polling dormant until degraded.
    pub baseline_poll_interval: Option<Duration>,
    pub degraded_poll_interval: Duration,
    pub push_grace_period: Duration,
    pub health_check_interval: Duration,
    pub recency_window: Duration,
    pub poll_limit: usize,
    pub optimistic_timeout: Duration,
    pub provisional_hold: Duration,
    pub push_retry_delay: Duration,
    pub poll_seen_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            baseline_poll_interval: Some(Duration::from_secs(5)),
            degraded_poll_interval: Duration::from_secs(1),
            push_grace_period: Duration::from_secs(3),
            health_check_interval: Duration::from_millis(250),
            recency_window: Duration::from_secs(60),
            poll_limit: 20,
            optimistic_timeout: Duration::from_secs(10),
            provisional_hold: Duration::from_millis(150),
            push_retry_delay: Duration::from_secs(1),
            poll_seen_capacity: 1024,
        }
    }
}

impl RealtimeConfig {
    /// Alert listeners poll continuously as a backstop.
    pub fn sos_alerts(app_config: &AppConfig) -> Self {
        Self {
            baseline_poll_interval: Some(Duration::from_millis(app_config.sos_poll_interval_ms)),
            ..Self::from_app_config(app_config)
        }
    }

    /// Chat threads only poll once the push feed is degraded.
    pub fn chat(app_config: &AppConfig) -> Self {
        Self {
            baseline_poll_interval: None,
            ..Self::from_app_config(app_config)
        }
    }

    fn from_app_config(app_config: &AppConfig) -> Self {
        let push_grace_period = Duration::from_millis(app_config.push_grace_period_ms);
        Self {
            degraded_poll_interval: Duration::from_millis(app_config.degraded_poll_interval_ms),
            push_grace_period,
            health_check_interval: (push_grace_period / 4).max(Duration::from_millis(10)),
            recency_window: Duration::from_secs(app_config.sos_recency_window_secs),
            optimistic_timeout: Duration::from_millis(app_config.optimistic_timeout_ms),
            ..Self::default()
        }
    }

    /// Time until a dead push feed is noticed and polling is accelerated.
    pub fn push_failure_detection_time(&self) -> Duration {
        self.push_grace_period + self.health_check_interval
    }
}
