use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::TransportError;
use super::{BroadcastBus, ChangePublisher, ChangeRecord, ChangeStream, FeedFilter, MessageStream, PushFeed};

const CHANGE_CHANNEL_PREFIX: &str = "changes";

/// Publishing goes through a pooled connection; every subscription opens a
/// dedicated connection because a pub/sub connection cannot issue commands.
#[derive(Clone)]
struct RedisPubSub {
    client: redis::Client,
    pool: Pool,
}

impl RedisPubSub {
    fn new(redis_url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url)?;
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| TransportError::Unavailable(format!("Failed to create Redis pool: {}", e)))?;

        Ok(Self { client, pool })
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), TransportError> {
        let mut conn = self.pool.get().await
            .map_err(|e| TransportError::Unavailable(format!("Failed to connect to Redis: {}", e)))?;
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!("Published to {} ({} receivers)", channel, receivers);
        Ok(())
    }

    async fn subscribe_raw(&self, channel: &str) -> Result<futures::stream::BoxStream<'static, String>, TransportError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;
        info!("Subscribed to Redis channel {}", channel);

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }
}

/// Ephemeral broadcast over Redis pub/sub.
#[derive(Clone)]
pub struct RedisBroadcastBus {
    inner: RedisPubSub,
}

impl RedisBroadcastBus {
    pub fn new(redis_url: &str) -> Result<Self, TransportError> {
        Ok(Self { inner: RedisPubSub::new(redis_url)? })
    }
}

#[async_trait]
impl BroadcastBus for RedisBroadcastBus {
    async fn send(&self, channel: &str, payload: Value) -> Result<(), TransportError> {
        self.inner.publish(channel, serde_json::to_string(&payload)?).await
    }

    async fn on_message(&self, channel: &str) -> Result<MessageStream, TransportError> {
        let stream = self.inner.subscribe_raw(channel).await?;
        Ok(stream
            .map(|raw| serde_json::from_str::<Value>(&raw).map_err(TransportError::from))
            .boxed())
    }
}

/// Row-change feed on `changes:{table}`, fed by [`RelayingWriter`](super::RelayingWriter).
#[derive(Clone)]
pub struct RedisChangeFeed {
    inner: RedisPubSub,
}

impl RedisChangeFeed {
    pub fn new(redis_url: &str) -> Result<Self, TransportError> {
        Ok(Self { inner: RedisPubSub::new(redis_url)? })
    }

    pub fn channel_for(table: &str) -> String {
        format!("{}:{}", CHANGE_CHANNEL_PREFIX, table)
    }
}

#[async_trait]
impl ChangePublisher for RedisChangeFeed {
    async fn publish_change(&self, record: &ChangeRecord) -> Result<(), TransportError> {
        let channel = Self::channel_for(&record.table);
        self.inner.publish(&channel, serde_json::to_string(record)?).await
    }
}

#[async_trait]
impl PushFeed for RedisChangeFeed {
    async fn subscribe(&self, filter: &FeedFilter) -> Result<ChangeStream, TransportError> {
        let stream = self.inner.subscribe_raw(&Self::channel_for(&filter.table)).await?;
        let filter = filter.clone();

        let changes = stream.filter_map(move |raw| {
            let parsed = serde_json::from_str::<ChangeRecord>(&raw);
            let keep = match &parsed {
                Ok(record) => filter.accepts(record),
                Err(_) => true,
            };
            async move { keep.then(|| parsed.map_err(TransportError::from)) }
        });

        Ok(changes.boxed())
    }
}
