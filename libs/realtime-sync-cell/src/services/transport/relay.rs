use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::TransportError;
use super::{ChangeOperation, ChangePublisher, ChangeRecord, WriteApi};

/// Writes through `store`, then announces each stored row on `feed`.
///
/// Used when the push feed is not attached to the database itself, so rows
/// written by this service still reach push subscribers. A failed announcement
/// is logged and does not fail the write; the poll backstop still finds the row.
pub struct RelayingWriter {
    store: Arc<dyn WriteApi>,
    feed: Arc<dyn ChangePublisher>,
}

impl RelayingWriter {
    pub fn new(store: Arc<dyn WriteApi>, feed: Arc<dyn ChangePublisher>) -> Self {
        Self { store, feed }
    }

    async fn announce(&self, operation: ChangeOperation, table: &str, row: &Value) {
        let record = ChangeRecord {
            operation,
            table: table.to_string(),
            row: row.clone(),
        };
        match self.feed.publish_change(&record).await {
            Ok(()) => debug!("Relayed {:?} on {}", operation, table),
            Err(e) => warn!("Failed to relay {:?} on {}: {}", operation, table, e),
        }
    }
}

#[async_trait]
impl WriteApi for RelayingWriter {
    async fn insert(&self, table: &str, fields: Value) -> Result<Value, TransportError> {
        let row = self.store.insert(table, fields).await?;
        self.announce(ChangeOperation::Insert, table, &row).await;
        Ok(row)
    }

    async fn update(&self, table: &str, id: &str, fields: Value) -> Result<Value, TransportError> {
        let row = self.store.update(table, id, fields).await?;
        self.announce(ChangeOperation::Update, table, &row).await;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::transport::{FeedFilter, MemoryBackend, PushFeed};
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn stored_rows_reach_a_separate_feed() {
        let store = MemoryBackend::new();
        let feed = MemoryBackend::new();
        let writer = RelayingWriter::new(Arc::new(store.clone()), Arc::new(feed.clone()));
        let mut changes = feed.subscribe(&FeedFilter::new("sos_events")).await.unwrap();

        let row = writer.insert("sos_events", json!({"user_id": "p1", "status": "active"})).await.unwrap();
        writer.update("sos_events", row["id"].as_str().unwrap(), json!({"status": "resolved"})).await.unwrap();

        let inserted = timeout(Duration::from_secs(1), changes.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(inserted.operation, ChangeOperation::Insert);
        assert_eq!(inserted.row["id"], row["id"]);

        let updated = timeout(Duration::from_secs(1), changes.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(updated.operation, ChangeOperation::Update);
        assert_eq!(updated.row["status"], "resolved");
        assert_eq!(store.rows("sos_events").await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_write_is_not_announced() {
        let store = MemoryBackend::new();
        let feed = MemoryBackend::new();
        store.fail_next_writes(1);
        let writer = RelayingWriter::new(Arc::new(store), Arc::new(feed.clone()));
        let mut changes = feed.subscribe(&FeedFilter::new("chat_messages")).await.unwrap();

        assert_matches!(
            writer.insert("chat_messages", json!({"message": "hello"})).await,
            Err(TransportError::Request(_))
        );
        assert!(timeout(Duration::from_millis(100), changes.next()).await.is_err());
    }
}
