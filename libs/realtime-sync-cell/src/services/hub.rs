use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::models::Notification;
use crate::services::session::NotificationReceiver;

pub type HubSender = broadcast::Sender<String>;
pub type HubReceiver = broadcast::Receiver<String>;

/// Fans a session's notifications out to any number of HTTP listeners.
/// Messages are serialised once and shared as JSON strings.
pub struct NotificationHub {
    channels: Arc<RwLock<HashMap<String, HubSender>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribes to `channel`, creating it on first use.
    pub async fn subscribe(&self, channel: &str) -> HubReceiver {
        if let Some(sender) = self.channels.read().await.get(channel) {
            return sender.subscribe();
        }

        let mut channels = self.channels.write().await;
        let sender = channels.entry(channel.to_string()).or_insert_with(|| {
            debug!("Created notification channel {}", channel);
            broadcast::channel(100).0
        });
        sender.subscribe()
    }

    /// Returns the number of listeners that received the message.
    pub async fn publish(&self, channel: &str, notification: &Notification) -> Result<usize, TransportError> {
        let message = serde_json::to_string(notification)?;

        let channels = self.channels.read().await;
        Ok(channels
            .get(channel)
            .and_then(|sender| sender.send(message).ok())
            .unwrap_or(0))
    }

    pub async fn get_active_channels(&self) -> Vec<String> {
        let channels = self.channels.read().await;
        channels.keys().cloned().collect()
    }

    /// Forwards a session's notifications into `channel` until the session ends.
    pub fn relay(self: Arc<Self>, channel: &str, mut receiver: NotificationReceiver) -> JoinHandle<()> {
        let hub = self;
        let channel = channel.to_string();

        tokio::spawn(async move {
            info!("Relaying notifications into {}", channel);
            while let Some(notification) = receiver.recv().await {
                match hub.publish(&channel, &notification).await {
                    Ok(listeners) => debug!("{} notification delivered to {} listeners", channel, listeners),
                    Err(e) => debug!("Failed to publish on {}: {}", channel, e),
                }
            }
            info!("Relay for {} finished", channel);
        })
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, EventKind, SourceChannel};
    use chrono::Utc;
    use serde_json::{Map, Value};

    fn insert(id: &str) -> Notification {
        Notification::Insert {
            event: Event::confirmed(id, EventKind::Sos, "p1", Map::new(), Utc::now(), SourceChannel::Push),
        }
    }

    #[tokio::test]
    async fn publishes_serialized_notifications_to_subscribers() {
        let hub = NotificationHub::new();
        let mut receiver = hub.subscribe("sos-alerts").await;
        let mut second = hub.subscribe("sos-alerts").await;

        let notification = insert("S1");
        assert_eq!(hub.publish("sos-alerts", &notification).await.unwrap(), 2);

        let message: Value = serde_json::from_str(&receiver.recv().await.unwrap()).unwrap();
        assert_eq!(message["kind"], "insert");
        assert_eq!(message["event"]["logical_id"], "S1");
        assert_eq!(second.recv().await.unwrap(), serde_json::to_string(&notification).unwrap());
    }

    #[tokio::test]
    async fn publishing_without_listeners_is_not_an_error() {
        let hub = NotificationHub::new();
        assert_eq!(hub.publish("nobody", &insert("S1")).await.unwrap(), 0);
        assert!(hub.get_active_channels().await.is_empty());

        let _receiver = hub.subscribe("sos-alerts").await;
        assert_eq!(hub.get_active_channels().await, vec!["sos-alerts".to_string()]);
    }

    #[tokio::test]
    async fn waiting_listener_is_woken_by_publish() {
        let hub = NotificationHub::new();
        let mut receiver = hub.subscribe("sos-alerts").await;

        let mut next = tokio_test::task::spawn(receiver.recv());
        tokio_test::assert_pending!(next.poll());

        hub.publish("sos-alerts", &insert("S1")).await.unwrap();
        assert!(next.is_woken());
        let message = tokio_test::assert_ready_ok!(next.poll());
        assert!(message.contains("\"S1\""));
    }
}
