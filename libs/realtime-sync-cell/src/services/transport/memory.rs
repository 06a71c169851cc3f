use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TransportError;
use super::{
    BroadcastBus, ChangeOperation, ChangePublisher, ChangeRecord, ChangeStream, FeedFilter,
    MessageStream, PollQuery, PushFeed, QueryApi, WriteApi,
};

/// In-process store with a change feed and pub/sub topics.
///
/// Serves local development without Redis or Supabase, and lets tests inject
/// push outages, slow queries and rejected writes.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

struct Inner {
    tables: RwLock<HashMap<String, Vec<Value>>>,
    changes: broadcast::Sender<ChangeRecord>,
    topics: RwLock<HashMap<String, broadcast::Sender<Value>>>,
    push_available: AtomicBool,
    outage: watch::Sender<u64>,
    failing_writes: AtomicUsize,
    query_delay_ms: AtomicU64,
    write_delay_ms: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1000);
        let (outage, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(HashMap::new()),
                changes,
                topics: RwLock::new(HashMap::new()),
                push_available: AtomicBool::new(true),
                outage,
                failing_writes: AtomicUsize::new(0),
                query_delay_ms: AtomicU64::new(0),
                write_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Turning push off closes every live subscription and rejects new ones.
    pub fn set_push_available(&self, available: bool) {
        self.inner.push_available.store(available, Ordering::SeqCst);
        if !available {
            self.inner.outage.send_modify(|generation| *generation += 1);
            debug!("In-memory push feed taken down");
        }
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.inner.query_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.inner.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Re-delivers a change on the push feed without touching stored rows.
    pub fn replay_change(&self, record: ChangeRecord) {
        if self.inner.changes.send(record).is_err() {
            debug!("No push subscribers for replayed change");
        }
    }

    pub async fn rows(&self, table: &str) -> Vec<Value> {
        let tables = self.inner.tables.read().await;
        tables.get(table).cloned().unwrap_or_default()
    }

    async fn store_row(&self, table: &str, fields: Value) -> Result<Value, TransportError> {
        let Value::Object(mut row) = fields else {
            return Err(TransportError::Request(format!("Row for {} must be an object", table)));
        };

        row.entry("id").or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        row.entry("created_at").or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        let row = Value::Object(row);

        {
            let mut tables = self.inner.tables.write().await;
            tables.entry(table.to_string()).or_default().push(row.clone());
        }

        self.publish(ChangeOperation::Insert, table, &row);
        Ok(row)
    }

    fn publish(&self, operation: ChangeOperation, table: &str, row: &Value) {
        let record = ChangeRecord {
            operation,
            table: table.to_string(),
            row: row.clone(),
        };
        if self.inner.changes.send(record).is_err() {
            debug!("No push subscribers for {} change", table);
        }
    }

    async fn simulate_write(&self) -> Result<(), TransportError> {
        let delay = self.inner.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let injected = self.inner.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Request("Injected write failure".to_string()));
        }
        Ok(())
    }

    async fn topic(&self, channel: &str) -> broadcast::Sender<Value> {
        if let Some(sender) = self.inner.topics.read().await.get(channel) {
            return sender.clone();
        }
        let mut topics = self.inner.topics.write().await;
        topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(100).0)
            .clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct FeedState {
    changes: broadcast::Receiver<ChangeRecord>,
    outage: watch::Receiver<u64>,
    filter: FeedFilter,
}

#[async_trait]
impl PushFeed for MemoryBackend {
    async fn subscribe(&self, filter: &FeedFilter) -> Result<ChangeStream, TransportError> {
        if !self.inner.push_available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("in-memory push feed is down".to_string()));
        }

        let state = FeedState {
            changes: self.inner.changes.subscribe(),
            outage: self.inner.outage.subscribe(),
            filter: filter.clone(),
        };

        let stream = futures::stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            loop {
                tokio::select! {
                    biased;
                    _ = state.outage.changed() => {
                        let closed = TransportError::Closed("in-memory push feed went down".to_string());
                        return Some((Err(closed), None));
                    }
                    received = state.changes.recv() => match received {
                        Ok(record) if state.filter.accepts(&record) => return Some((Ok(record), Some(state))),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Push subscriber lagged, {} changes skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[async_trait]
impl ChangePublisher for MemoryBackend {
    async fn publish_change(&self, record: &ChangeRecord) -> Result<(), TransportError> {
        self.replay_change(record.clone());
        Ok(())
    }
}

#[async_trait]
impl BroadcastBus for MemoryBackend {
    async fn send(&self, channel: &str, payload: Value) -> Result<(), TransportError> {
        let sender = self.topic(channel).await;
        if sender.send(payload).is_err() {
            debug!("Broadcast on {} had no listeners", channel);
        }
        Ok(())
    }

    async fn on_message(&self, channel: &str) -> Result<MessageStream, TransportError> {
        let receiver = self.topic(channel).await.subscribe();

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => return Some((Ok(payload), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Broadcast listener lagged, {} messages skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[async_trait]
impl QueryApi for MemoryBackend {
    async fn query(&self, query: &PollQuery) -> Result<Vec<Value>, TransportError> {
        let delay = self.inner.query_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let tables = self.inner.tables.read().await;
        let mut rows: Vec<(DateTime<Utc>, Value)> = tables
            .get(&query.filter.table)
            .map(|rows| rows.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|row| query.filter.matches(row))
            .filter_map(|row| created_at(row).map(|ts| (ts, row.clone())))
            .filter(|(ts, _)| *ts > query.created_after)
            .collect();

        rows.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(rows.into_iter().take(query.limit).map(|(_, row)| row).collect())
    }
}

#[async_trait]
impl WriteApi for MemoryBackend {
    async fn insert(&self, table: &str, fields: Value) -> Result<Value, TransportError> {
        self.simulate_write().await?;
        self.store_row(table, fields).await
    }

    async fn update(&self, table: &str, id: &str, fields: Value) -> Result<Value, TransportError> {
        self.simulate_write().await?;

        let changes: Map<String, Value> = match fields {
            Value::Object(map) => map,
            _ => return Err(TransportError::Request("Update fields must be an object".to_string())),
        };

        let updated = {
            let mut tables = self.inner.tables.write().await;
            let row = tables
                .get_mut(table)
                .and_then(|rows| rows.iter_mut().find(|row| row.get("id").and_then(Value::as_str) == Some(id)))
                .ok_or_else(|| TransportError::Request(format!("Resource not found: {} row {}", table, id)))?;

            if let Value::Object(existing) = row {
                existing.extend(changes);
            }
            row.clone()
        };

        self.publish(ChangeOperation::Update, table, &updated);
        Ok(updated)
    }
}

fn created_at(row: &Value) -> Option<DateTime<Utc>> {
    row.get("created_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::timeout;

    #[tokio::test]
    async fn insert_assigns_id_and_notifies_subscribers() {
        let backend = MemoryBackend::new();
        let mut stream = backend.subscribe(&FeedFilter::new("sos_events")).await.unwrap();

        let row = backend.insert("sos_events", json!({"user_id": "p1", "status": "active"})).await.unwrap();
        assert!(row.get("id").is_some());

        let record = timeout(Duration::from_secs(1), stream.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(record.operation, ChangeOperation::Insert);
        assert_eq!(record.row, row);
    }

    #[tokio::test]
    async fn outage_closes_live_streams_and_rejects_subscribes() {
        let backend = MemoryBackend::new();
        let mut stream = backend.subscribe(&FeedFilter::new("sos_events")).await.unwrap();

        backend.set_push_available(false);
        let item = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(matches!(item, Some(Err(TransportError::Closed(_)))));
        assert!(timeout(Duration::from_secs(1), stream.next()).await.unwrap().is_none());

        assert!(backend.subscribe(&FeedFilter::new("sos_events")).await.is_err());
    }

    #[tokio::test]
    async fn query_filters_by_recency_and_orders_newest_first() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        for (id, age) in [("old", 120), ("a", 10), ("b", 5)] {
            let ts = (now - chrono::Duration::seconds(age)).to_rfc3339();
            backend.insert("sos_events", json!({"id": id, "status": "active", "created_at": ts})).await.unwrap();
        }

        let rows = backend.query(&PollQuery {
            filter: FeedFilter::new("sos_events").eq("status", "active"),
            created_after: now - chrono::Duration::seconds(60),
            limit: 10,
        }).await.unwrap();

        let ids: Vec<_> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_next_writes(1);
        assert!(backend.insert("chat_messages", json!({"message": "x"})).await.is_err());
        assert!(backend.insert("chat_messages", json!({"message": "x"})).await.is_ok());
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let backend = MemoryBackend::new();
        backend.insert("sos_events", json!({"id": "S1", "status": "active"})).await.unwrap();
        let row = backend.update("sos_events", "S1", json!({"status": "resolved"})).await.unwrap();
        assert_eq!(row["status"], "resolved");
        assert!(backend.update("sos_events", "missing", json!({})).await.is_err());
    }
}
