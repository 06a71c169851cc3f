//! Contracts of the external collaborators the reconciliation core consumes,
//! plus the concrete transports the service ships with.

pub mod memory;
pub mod redis_pubsub;
pub mod relay;
pub mod supabase;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use shared_config::AppConfig;
use shared_database::supabase::RestQuery;

use crate::error::TransportError;

pub use self::memory::MemoryBackend;
pub use self::redis_pubsub::{RedisBroadcastBus, RedisChangeFeed};
pub use self::relay::RelayingWriter;
pub use self::supabase::SupabaseStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One server-pushed row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub operation: ChangeOperation,
    pub table: String,
    pub row: Value,
}

/// Table plus equality constraints, shared by push subscriptions and polls.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedFilter {
    pub table: String,
    pub equals: Vec<(String, String)>,
}

impl FeedFilter {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            equals: Vec::new(),
        }
    }

    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.equals.push((column.to_string(), value.to_string()));
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.equals.iter().all(|(column, expected)| match row.get(column) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Number(n)) => n.to_string() == *expected,
            Some(Value::Bool(b)) => b.to_string() == *expected,
            _ => false,
        })
    }

    pub fn accepts(&self, record: &ChangeRecord) -> bool {
        record.table == self.table && self.matches(&record.row)
    }
}

/// Recent rows matching a filter, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct PollQuery {
    pub filter: FeedFilter,
    pub created_after: DateTime<Utc>,
    pub limit: usize,
}

impl PollQuery {
    pub fn to_rest_query(&self) -> RestQuery {
        let mut query = RestQuery::new(&self.filter.table);
        for (column, value) in &self.filter.equals {
            query = query.eq(column, value);
        }
        query
            .gt("created_at", &self.created_after.to_rfc3339())
            .order_by("created_at", false)
            .limit(self.limit)
    }
}

pub type ChangeStream = BoxStream<'static, Result<ChangeRecord, TransportError>>;
pub type MessageStream = BoxStream<'static, Result<Value, TransportError>>;

/// Server-push change feed. A successful `subscribe` counts as the acknowledgment.
#[async_trait]
pub trait PushFeed: Send + Sync {
    async fn subscribe(&self, filter: &FeedFilter) -> Result<ChangeStream, TransportError>;
}

/// Ephemeral pub/sub with no persistence, ordering or delivery guarantee.
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    async fn send(&self, channel: &str, payload: Value) -> Result<(), TransportError>;
    async fn on_message(&self, channel: &str) -> Result<MessageStream, TransportError>;
}

/// Announces a row change on a push feed.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    async fn publish_change(&self, record: &ChangeRecord) -> Result<(), TransportError>;
}

#[async_trait]
pub trait QueryApi: Send + Sync {
    async fn query(&self, query: &PollQuery) -> Result<Vec<Value>, TransportError>;
}

/// Authoritative writes. Both calls return the stored row.
#[async_trait]
pub trait WriteApi: Send + Sync {
    async fn insert(&self, table: &str, fields: Value) -> Result<Value, TransportError>;
    async fn update(&self, table: &str, id: &str, fields: Value) -> Result<Value, TransportError>;
}

/// The collaborators one realtime session runs against.
#[derive(Clone)]
pub struct RealtimeBackends {
    pub push: Arc<dyn PushFeed>,
    pub broadcast: Option<Arc<dyn BroadcastBus>>,
    pub query: Arc<dyn QueryApi>,
    pub write: Arc<dyn WriteApi>,
}

impl RealtimeBackends {
    pub fn in_memory(backend: &MemoryBackend) -> Self {
        Self {
            push: Arc::new(backend.clone()),
            broadcast: Some(Arc::new(backend.clone())),
            query: Arc::new(backend.clone()),
            write: Arc::new(backend.clone()),
        }
    }

    /// Redis carries push and broadcast when configured; Supabase serves polls and
    /// writes when configured. Anything missing falls back to one in-process backend.
    ///
    /// Whenever writes and push are served by different backends, writes are
    /// relayed onto the push feed so the service observes its own rows.
    pub fn from_config(config: &AppConfig) -> Result<Self, TransportError> {
        let memory = MemoryBackend::new();
        let mut backends = Self::in_memory(&memory);
        let mut publisher: Option<Arc<dyn ChangePublisher>> = None;

        if let Some(redis_url) = &config.redis_url {
            info!("Using Redis for realtime push and broadcast channels");
            let feed = Arc::new(RedisChangeFeed::new(redis_url)?);
            backends.push = feed.clone();
            backends.broadcast = Some(Arc::new(RedisBroadcastBus::new(redis_url)?));
            publisher = Some(feed as Arc<dyn ChangePublisher>);
        }

        if config.is_configured() {
            info!("Using Supabase for realtime polling and writes");
            let store = Arc::new(SupabaseStore::new(config));
            backends.query = store.clone();
            backends.write = store;
            if publisher.is_none() {
                publisher = Some(Arc::new(memory.clone()) as Arc<dyn ChangePublisher>);
            }
        }

        if let Some(feed) = publisher {
            info!("Relaying realtime writes onto the push feed");
            backends.write = Arc::new(RelayingWriter::new(backends.write, feed));
        }

        Ok(backends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_string_and_numeric_columns() {
        let filter = FeedFilter::new("chat_messages").eq("consultation_id", "42");
        assert!(filter.matches(&json!({"consultation_id": "42"})));
        assert!(filter.matches(&json!({"consultation_id": 42})));
        assert!(!filter.matches(&json!({"consultation_id": "43"})));
        assert!(!filter.matches(&json!({"message": "hi"})));
    }

    #[test]
    fn filter_rejects_other_tables() {
        let filter = FeedFilter::new("sos_events");
        let record = ChangeRecord {
            operation: ChangeOperation::Insert,
            table: "chat_messages".into(),
            row: json!({}),
        };
        assert!(!filter.accepts(&record));
    }

    #[test]
    fn change_record_uses_uppercase_operations() {
        let record: ChangeRecord = serde_json::from_value(json!({
            "operation": "INSERT",
            "table": "sos_events",
            "row": {"id": "S1"}
        })).unwrap();
        assert_eq!(record.operation, ChangeOperation::Insert);
    }

    #[tokio::test]
    async fn in_process_config_writes_straight_to_its_own_feed() {
        use futures::StreamExt;

        let backends = RealtimeBackends::from_config(&AppConfig::default()).unwrap();
        let mut changes = backends.push.subscribe(&FeedFilter::new("chat_messages")).await.unwrap();

        backends.write.insert("chat_messages", json!({"sender_id": "a", "message": "hi"})).await.unwrap();
        let record = tokio::time::timeout(std::time::Duration::from_secs(1), changes.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.row["message"], "hi");
        assert!(tokio::time::timeout(std::time::Duration::from_millis(100), changes.next()).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_redis_relay_does_not_fail_writes() {
        let config = AppConfig {
            redis_url: Some("redis://127.0.0.1:1".to_string()),
            ..AppConfig::default()
        };
        let backends = RealtimeBackends::from_config(&config).unwrap();

        let row = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            backends.write.insert("sos_events", json!({"user_id": "p1", "status": "active"})),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(row["status"], "active");
    }

    #[test]
    fn poll_query_renders_recency_and_order() {
        let created_after = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc);
        let query = PollQuery {
            filter: FeedFilter::new("sos_events").eq("status", "active"),
            created_after,
            limit: 1,
        };
        let pairs = query.to_rest_query().query_pairs();
        assert!(pairs.contains(&("status".to_string(), "eq.active".to_string())));
        assert!(pairs.contains(&("created_at".to_string(), "gt.2024-05-01T10:00:00+00:00".to_string())));
        assert!(pairs.contains(&("order".to_string(), "created_at.desc".to_string())));
        assert!(pairs.contains(&("limit".to_string(), "1".to_string())));
    }
}
