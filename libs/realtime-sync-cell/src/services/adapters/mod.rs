//! Channel adapters: each one turns a transport into a stream of normalised
//! envelopes pushed into an [`EventSink`], and reports its own health.

pub mod broadcast;
pub mod poll;
pub mod push;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::{Event, Key, SourceChannel};

pub use self::broadcast::BroadcastAdapter;
pub use self::poll::{PollAdapter, PollControl};
pub use self::push::PushFeedAdapter;

/// What an adapter hands to the reconciliation engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(Event),
    Resolved { key: Key, event: Option<Event> },
}

/// Where adapters deliver. Returns `false` once the receiving side is gone.
#[derive(Clone)]
pub struct EventSink {
    deliver: Arc<dyn Fn(Inbound) -> bool + Send + Sync>,
}

impl EventSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(Inbound) -> bool + Send + Sync + 'static,
    {
        Self { deliver: Arc::new(deliver) }
    }

    pub fn from_channel<T, F>(sender: mpsc::UnboundedSender<T>, wrap: F) -> Self
    where
        T: Send + 'static,
        F: Fn(Inbound) -> T + Send + Sync + 'static,
    {
        Self::new(move |inbound| sender.send(wrap(inbound)).is_ok())
    }

    pub fn emit(&self, event: Event) -> bool {
        (self.deliver)(Inbound::Event(event))
    }

    pub fn resolve(&self, key: Key, event: Option<Event>) -> bool {
        (self.deliver)(Inbound::Resolved { key, event })
    }
}

/// A running adapter. Cancelling stops delivery; nothing is emitted afterwards.
pub struct Subscription {
    channel: SourceChannel,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn spawn<F, Fut>(channel: SourceChannel, task: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(task(shutdown_rx));
        Self { channel, shutdown, handle }
    }

    pub fn channel(&self) -> SourceChannel {
        self.channel
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(self) {
        let _ = self.shutdown.send(true);
        self.handle.abort();
    }
}

/// Liveness flag plus the instant it last flipped.
#[derive(Debug)]
pub struct ChannelHealth {
    channel: SourceChannel,
    healthy: AtomicBool,
    changed_at: Mutex<Instant>,
}

impl ChannelHealth {
    pub fn new(channel: SourceChannel, healthy: bool) -> Self {
        Self {
            channel,
            healthy: AtomicBool::new(healthy),
            changed_at: Mutex::new(Instant::now()),
        }
    }

    pub fn mark_healthy(&self) {
        if !self.healthy.swap(true, Ordering::SeqCst) {
            self.touch();
            info!("{} channel is healthy", self.channel);
        }
    }

    pub fn mark_unhealthy(&self, reason: &str) {
        if self.healthy.swap(false, Ordering::SeqCst) {
            self.touch();
            warn!("{} channel became unhealthy: {}", self.channel, reason);
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// How long the channel has been continuously unhealthy; `None` while healthy.
    pub fn unhealthy_for(&self, now: Instant) -> Option<Duration> {
        if self.is_healthy() {
            return None;
        }
        let changed_at = *self.changed_at.lock().unwrap_or_else(|e| e.into_inner());
        Some(now.saturating_duration_since(changed_at))
    }

    fn touch(&self) {
        *self.changed_at.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

/// Uniform surface over push, broadcast and poll.
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> SourceChannel;

    /// Spawns delivery into `sink`. Must be called inside a Tokio runtime.
    fn start(&self, sink: EventSink) -> Subscription;

    fn stop(&self, subscription: Subscription) {
        subscription.cancel();
    }

    fn is_healthy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;
    use chrono::Utc;
    use serde_json::Map;

    #[test]
    fn health_tracks_unhealthy_duration() {
        let health = ChannelHealth::new(SourceChannel::Push, false);
        let later = Instant::now() + Duration::from_secs(2);
        assert!(health.unhealthy_for(later).unwrap() >= Duration::from_secs(2));

        health.mark_healthy();
        assert!(health.is_healthy());
        assert_eq!(health.unhealthy_for(later), None);

        health.mark_unhealthy("stream ended");
        assert!(health.unhealthy_for(Instant::now()).unwrap() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::from_channel(tx, |inbound| inbound);
        assert!(sink.resolve(Key::logical(EventKind::Sos, "S1"), None));

        drop(rx);
        let event = Event::confirmed("S1", EventKind::Sos, "p", Map::new(), Utc::now(), SourceChannel::Push);
        assert!(!sink.emit(event));
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_its_task() {
        let subscription = Subscription::spawn(SourceChannel::Poll, |mut shutdown| async move {
            let _ = shutdown.changed().await;
        });
        assert_eq!(subscription.channel(), SourceChannel::Poll);
        subscription.cancel();
    }
}
