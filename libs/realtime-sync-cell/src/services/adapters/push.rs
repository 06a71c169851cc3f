use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::{EventKind, SourceChannel};
use crate::services::normalize::{normalize_change, Normalized};
use crate::services::transport::{FeedFilter, PushFeed};
use super::{ChannelAdapter, ChannelHealth, EventSink, Subscription};

/// Server-push change feed. Healthy only between a successful subscribe and
/// the first stream error; resubscribes after `retry_delay`.
pub struct PushFeedAdapter {
    kind: EventKind,
    feed: Arc<dyn PushFeed>,
    filter: FeedFilter,
    retry_delay: Duration,
    health: Arc<ChannelHealth>,
}

impl PushFeedAdapter {
    pub fn new(kind: EventKind, feed: Arc<dyn PushFeed>, filter: FeedFilter, retry_delay: Duration) -> Self {
        Self {
            kind,
            feed,
            filter,
            retry_delay,
            health: Arc::new(ChannelHealth::new(SourceChannel::Push, false)),
        }
    }

    pub fn health(&self) -> Arc<ChannelHealth> {
        self.health.clone()
    }
}

impl ChannelAdapter for PushFeedAdapter {
    fn channel(&self) -> SourceChannel {
        SourceChannel::Push
    }

    fn start(&self, sink: EventSink) -> Subscription {
        let kind = self.kind;
        let feed = self.feed.clone();
        let filter = self.filter.clone();
        let retry_delay = self.retry_delay;
        let health = self.health.clone();

        Subscription::spawn(SourceChannel::Push, move |shutdown| {
            run_push_loop(kind, feed, filter, retry_delay, health, sink, shutdown)
        })
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

async fn run_push_loop(
    kind: EventKind,
    feed: Arc<dyn PushFeed>,
    filter: FeedFilter,
    retry_delay: Duration,
    health: Arc<ChannelHealth>,
    sink: EventSink,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Push adapter started for {}", filter.table);

    loop {
        let subscribed = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = feed.subscribe(&filter) => result,
        };

        match subscribed {
            Ok(mut stream) => {
                health.mark_healthy();

                loop {
                    let item = tokio::select! {
                        biased;
                        _ = shutdown.changed() => return,
                        item = stream.next() => item,
                    };

                    match item {
                        Some(Ok(record)) => {
                            let delivered = match normalize_change(kind, &record) {
                                Ok(Normalized::Event(event)) => sink.emit(event),
                                Ok(Normalized::Resolved { key, event }) => sink.resolve(key, event),
                                Ok(Normalized::Ignored) => true,
                                Err(e) => {
                                    warn!("Dropping malformed {} change: {}", record.table, e);
                                    true
                                }
                            };
                            if !delivered {
                                debug!("Push sink closed, stopping adapter");
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            health.mark_unhealthy(&e.to_string());
                            break;
                        }
                        None => {
                            health.mark_unhealthy("push stream ended");
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

    debug!("Push adapter for {} stopped", filter.table);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::adapters::Inbound;
    use crate::services::transport::{MemoryBackend, WriteApi};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn adapter(backend: &MemoryBackend) -> PushFeedAdapter {
        PushFeedAdapter::new(
            EventKind::Sos,
            Arc::new(backend.clone()),
            FeedFilter::new("sos_events"),
            Duration::from_millis(20),
        )
    }

    async fn wait_until(check: impl Fn() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn delivers_inserts_after_subscribe() {
        let backend = MemoryBackend::new();
        let push = adapter(&backend);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = push.start(EventSink::from_channel(tx, |inbound| inbound));

        wait_until(|| push.is_healthy()).await;
        backend.insert("sos_events", json!({"id": "S1", "user_id": "p1", "latitude": 1.0})).await.unwrap();

        let inbound = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        match inbound {
            Inbound::Event(event) => assert_eq!(event.logical_id.as_deref(), Some("S1")),
            other => panic!("unexpected {:?}", other),
        }
        push.stop(subscription);
    }

    #[tokio::test]
    async fn outage_marks_unhealthy_and_recovery_resubscribes() {
        let backend = MemoryBackend::new();
        let push = adapter(&backend);
        let (tx, _rx) = mpsc::unbounded_channel::<Inbound>();
        let subscription = push.start(EventSink::from_channel(tx, |inbound| inbound));

        wait_until(|| push.is_healthy()).await;
        backend.set_push_available(false);
        wait_until(|| !push.is_healthy()).await;

        backend.set_push_available(true);
        wait_until(|| push.is_healthy()).await;
        subscription.cancel();
    }
}
