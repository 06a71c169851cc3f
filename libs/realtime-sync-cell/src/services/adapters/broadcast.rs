use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::models::SourceChannel;
use crate::services::normalize::event_from_broadcast;
use crate::services::transport::BroadcastBus;
use super::{ChannelAdapter, ChannelHealth, EventSink, Subscription};

/// Low-latency SOS side-channel. Payloads carry a client placeholder id, so
/// every event it emits is provisional.
pub struct BroadcastAdapter {
    bus: Arc<dyn BroadcastBus>,
    topic: String,
    retry_delay: Duration,
    health: Arc<ChannelHealth>,
}

impl BroadcastAdapter {
    pub fn new(bus: Arc<dyn BroadcastBus>, topic: &str, retry_delay: Duration) -> Self {
        Self {
            bus,
            topic: topic.to_string(),
            retry_delay,
            health: Arc::new(ChannelHealth::new(SourceChannel::Broadcast, false)),
        }
    }
}

impl ChannelAdapter for BroadcastAdapter {
    fn channel(&self) -> SourceChannel {
        SourceChannel::Broadcast
    }

    fn start(&self, sink: EventSink) -> Subscription {
        let bus = self.bus.clone();
        let topic = self.topic.clone();
        let retry_delay = self.retry_delay;
        let health = self.health.clone();

        Subscription::spawn(SourceChannel::Broadcast, move |mut shutdown: watch::Receiver<bool>| async move {
            loop {
                let listening = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    result = bus.on_message(&topic) => result,
                };

                match listening {
                    Ok(mut messages) => {
                        health.mark_healthy();
                        loop {
                            let message = tokio::select! {
                                biased;
                                _ = shutdown.changed() => return,
                                message = messages.next() => message,
                            };

                            match message {
                                Some(Ok(payload)) => match event_from_broadcast(&payload) {
                                    Ok(event) => {
                                        if !sink.emit(event) {
                                            return;
                                        }
                                    }
                                    Err(e) => warn!("Ignoring broadcast on {}: {}", topic, e),
                                },
                                Some(Err(e)) => {
                                    health.mark_unhealthy(&e.to_string());
                                    break;
                                }
                                None => {
                                    health.mark_unhealthy("broadcast stream ended");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => health.mark_unhealthy(&e.to_string()),
                }

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
            debug!("Broadcast adapter for {} stopped", topic);
        })
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SOS_BROADCAST_CHANNEL;
    use crate::services::adapters::Inbound;
    use crate::services::transport::MemoryBackend;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn incomplete_broadcasts_are_passed_on_as_provisional() {
        let backend = MemoryBackend::new();
        let adapter = BroadcastAdapter::new(Arc::new(backend.clone()), SOS_BROADCAST_CHANNEL, Duration::from_millis(20));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = adapter.start(EventSink::from_channel(tx, |inbound| inbound));

        timeout(Duration::from_secs(2), async {
            while !adapter.is_healthy() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();

        backend.send(SOS_BROADCAST_CHANNEL, json!("not an object")).await.unwrap();
        backend.send(SOS_BROADCAST_CHANNEL, json!({
            "id": "temp-1", "user_name": "Ada", "latitude": 6.5, "longitude": 3.3
        })).await.unwrap();
        backend.send(SOS_BROADCAST_CHANNEL, json!({"latitude": 6.5, "longitude": 3.3})).await.unwrap();

        let inbound = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_matches!(inbound, Inbound::Event(event) => {
            assert!(event.is_provisional());
            assert_eq!(event.local_id.as_deref(), Some("temp-1"));
            assert_eq!(event.origin_id, "");
            assert_eq!(event.source_channel, SourceChannel::Broadcast);
        });

        let inbound = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_matches!(inbound, Inbound::Event(event) => {
            assert_eq!(event.local_id, None);
            assert_eq!(event.logical_id, None);
        });
        subscription.cancel();
    }
}
