use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::models::{EventKind, RealtimeConfig, SourceChannel};
use crate::services::normalize::event_from_row;
use crate::services::transport::{FeedFilter, PollQuery, QueryApi};
use super::{ChannelAdapter, ChannelHealth, EventSink, Subscription};

/// Shared poll cadence. Written by the delivery monitor, read by the poll loop.
#[derive(Debug, Default)]
pub struct PollControl {
    interval_ms: AtomicU64,
    wake: Notify,
}

impl PollControl {
    pub fn new(interval: Option<Duration>) -> Self {
        let control = Self::default();
        control.interval_ms.store(to_millis(interval), Ordering::SeqCst);
        control
    }

    /// `None` means dormant.
    pub fn interval(&self) -> Option<Duration> {
        match self.interval_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Applies a new cadence and wakes the poll loop when it changed.
    pub fn set_interval(&self, interval: Option<Duration>) -> bool {
        let previous = self.interval_ms.swap(to_millis(interval), Ordering::SeqCst);
        let changed = previous != to_millis(interval);
        if changed {
            self.wake.notify_one();
        }
        changed
    }
}

fn to_millis(interval: Option<Duration>) -> u64 {
    interval.map(|d| (d.as_millis() as u64).max(1)).unwrap_or(0)
}

/// Row ids already emitted, oldest evicted first.
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}

/// Periodic query over the recency window. Dormant while the interval is `None`.
pub struct PollAdapter {
    kind: EventKind,
    query: Arc<dyn QueryApi>,
    filter: FeedFilter,
    recency_window: Duration,
    limit: usize,
    seen_capacity: usize,
    control: Arc<PollControl>,
    health: Arc<ChannelHealth>,
}

impl PollAdapter {
    pub fn new(kind: EventKind, query: Arc<dyn QueryApi>, filter: FeedFilter, config: &RealtimeConfig) -> Self {
        Self {
            kind,
            query,
            filter,
            recency_window: config.recency_window,
            limit: config.poll_limit,
            seen_capacity: config.poll_seen_capacity,
            control: Arc::new(PollControl::new(config.baseline_poll_interval)),
            health: Arc::new(ChannelHealth::new(SourceChannel::Poll, true)),
        }
    }

    pub fn control(&self) -> Arc<PollControl> {
        self.control.clone()
    }
}

impl ChannelAdapter for PollAdapter {
    fn channel(&self) -> SourceChannel {
        SourceChannel::Poll
    }

    fn start(&self, sink: EventSink) -> Subscription {
        let worker = PollWorker {
            kind: self.kind,
            query: self.query.clone(),
            filter: self.filter.clone(),
            recency_window: chrono::Duration::from_std(self.recency_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            limit: self.limit,
            seen: SeenIds::new(self.seen_capacity),
            control: self.control.clone(),
            health: self.health.clone(),
            sink,
        };

        Subscription::spawn(SourceChannel::Poll, move |shutdown| worker.run(shutdown))
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

struct PollWorker {
    kind: EventKind,
    query: Arc<dyn QueryApi>,
    filter: FeedFilter,
    recency_window: chrono::Duration,
    limit: usize,
    seen: SeenIds,
    control: Arc<PollControl>,
    health: Arc<ChannelHealth>,
    sink: EventSink,
}

impl PollWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_now = self.control.interval().is_some();

        loop {
            if poll_now {
                let query = PollQuery {
                    filter: self.filter.clone(),
                    created_after: Utc::now() - self.recency_window,
                    limit: self.limit,
                };

                let result = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    result = self.query.query(&query) => result,
                };

                match result {
                    Ok(rows) => {
                        self.health.mark_healthy();
                        if !self.deliver(rows) {
                            debug!("Poll sink closed, stopping adapter");
                            return;
                        }
                    }
                    Err(e) => self.health.mark_unhealthy(&e.to_string()),
                }
            }

            let interval = self.control.interval();
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = self.control.wake.notified() => {
                    poll_now = self.control.interval().is_some();
                }
                _ = tokio::time::sleep(interval.unwrap_or_default()), if interval.is_some() => {
                    poll_now = true;
                }
            }
        }

        debug!("Poll adapter for {} stopped", self.filter.table);
    }

    /// Rows arrive newest first; they are emitted oldest first.
    fn deliver(&mut self, rows: Vec<serde_json::Value>) -> bool {
        for row in rows.iter().rev() {
            let event = match event_from_row(self.kind, row, SourceChannel::Poll) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping polled {} row: {}", self.filter.table, e);
                    continue;
                }
            };

            if !self.seen.insert(event.display_id()) {
                continue;
            }
            if !self.sink.emit(event) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::adapters::Inbound;
    use crate::services::transport::{MemoryBackend, WriteApi};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn config(interval: Option<Duration>) -> RealtimeConfig {
        RealtimeConfig {
            baseline_poll_interval: interval,
            ..RealtimeConfig::default()
        }
    }

    #[test]
    fn seen_ids_evict_oldest() {
        let mut seen = SeenIds::new(2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        assert!(seen.insert("a"));
    }

    #[test]
    fn control_reports_changes_only() {
        let control = PollControl::new(None);
        assert_eq!(control.interval(), None);
        assert!(control.set_interval(Some(Duration::from_secs(1))));
        assert!(!control.set_interval(Some(Duration::from_secs(1))));
        assert_eq!(control.interval(), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn polls_on_start_and_emits_each_row_once_oldest_first() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        for (id, age) in [("S1", 20), ("S2", 10)] {
            let created_at = (now - chrono::Duration::seconds(age)).to_rfc3339();
            backend.insert("sos_events", json!({"id": id, "user_id": "p1", "status": "active", "created_at": created_at}))
                .await.unwrap();
        }

        let adapter = PollAdapter::new(
            EventKind::Sos,
            Arc::new(backend.clone()),
            FeedFilter::new("sos_events").eq("status", "active"),
            &config(Some(Duration::from_millis(30))),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = adapter.start(EventSink::from_channel(tx, |inbound| inbound));

        let mut ids = Vec::new();
        for _ in 0..2 {
            if let Some(Inbound::Event(event)) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
                ids.push(event.display_id().to_string());
            }
        }
        assert_eq!(ids, vec!["S1", "S2"]);

        // Later polls return the same rows; nothing new is emitted.
        assert!(timeout(Duration::from_millis(120), rx.recv()).await.is_err());
        subscription.cancel();
    }

    #[tokio::test]
    async fn dormant_poll_starts_when_woken() {
        let backend = MemoryBackend::new();
        backend.insert("sos_events", json!({"id": "S1", "user_id": "p1", "status": "active"})).await.unwrap();

        let adapter = PollAdapter::new(
            EventKind::Sos,
            Arc::new(backend.clone()),
            FeedFilter::new("sos_events"),
            &config(None),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = adapter.start(EventSink::from_channel(tx, |inbound| inbound));

        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        adapter.control().set_interval(Some(Duration::from_millis(50)));
        let inbound = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(inbound, Some(Inbound::Event(_))));
        subscription.cancel();
    }
}
