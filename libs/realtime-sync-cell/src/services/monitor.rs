use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::{CurrentHealth, RealtimeConfig};
use crate::services::adapters::{ChannelHealth, PollControl};

/// Watches push health and switches the poll cadence between baseline and
/// degraded, so that alert latency stays bounded while push is down.
pub struct DeliveryMonitor {
    push_health: Arc<ChannelHealth>,
    poll: Arc<PollControl>,
    baseline_interval: Option<Duration>,
    degraded_interval: Duration,
    grace_period: Duration,
    check_interval: Duration,
    published: watch::Sender<CurrentHealth>,
}

impl DeliveryMonitor {
    pub fn new(config: &RealtimeConfig, push_health: Arc<ChannelHealth>, poll: Arc<PollControl>) -> Self {
        let initial = CurrentHealth {
            push_ok: push_health.is_healthy(),
            poll_interval_ms: poll.interval().map(|d| d.as_millis() as u64),
            latency_bound_ms: 0,
        };
        let (published, _) = watch::channel(initial);

        let monitor = Self {
            push_health,
            poll,
            baseline_interval: config.baseline_poll_interval,
            degraded_interval: config.degraded_poll_interval,
            grace_period: config.push_grace_period,
            check_interval: config.health_check_interval,
            published,
        };
        monitor.published.send_modify(|health| {
            health.latency_bound_ms = monitor.current_latency_bound().as_millis() as u64;
        });
        monitor
    }

    pub fn subscribe(&self) -> watch::Receiver<CurrentHealth> {
        self.published.subscribe()
    }

    pub fn is_degraded(&self, now: Instant) -> bool {
        self.push_health
            .unhealthy_for(now)
            .is_some_and(|down_for| down_for >= self.grace_period)
    }

    /// Applies the cadence for the push state observed at `now` and publishes it.
    pub fn evaluate(&self, now: Instant) -> CurrentHealth {
        let degraded = self.is_degraded(now);
        let interval = if degraded {
            Some(self.degraded_interval)
        } else {
            self.baseline_interval
        };

        if self.poll.set_interval(interval) {
            if degraded {
                warn!("Push degraded, polling every {:?}", self.degraded_interval);
            } else {
                info!("Push recovered, poll interval back to {:?}", interval);
            }
        }

        let health = CurrentHealth {
            push_ok: self.push_health.is_healthy(),
            poll_interval_ms: interval.map(|d| d.as_millis() as u64),
            latency_bound_ms: self.current_latency_bound().as_millis() as u64,
        };
        self.published.send_replace(health);
        health
    }

    /// Worst-case delay before an event is delivered by some channel.
    pub fn current_latency_bound(&self) -> Duration {
        let detection = self.grace_period + self.check_interval;
        let poll = self.poll.interval().unwrap_or(self.degraded_interval);
        detection.max(poll)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("Delivery monitor started");
        loop {
            self.evaluate(Instant::now());
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }
        debug!("Delivery monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceChannel;

    fn config(baseline: Option<Duration>) -> RealtimeConfig {
        RealtimeConfig {
            baseline_poll_interval: baseline,
            degraded_poll_interval: Duration::from_secs(1),
            push_grace_period: Duration::from_secs(3),
            health_check_interval: Duration::from_millis(250),
            ..RealtimeConfig::default()
        }
    }

    fn monitor(baseline: Option<Duration>, push_ok: bool) -> (DeliveryMonitor, Arc<ChannelHealth>, Arc<PollControl>) {
        let health = Arc::new(ChannelHealth::new(SourceChannel::Push, push_ok));
        let poll = Arc::new(PollControl::new(baseline));
        let monitor = DeliveryMonitor::new(&config(baseline), health.clone(), poll.clone());
        (monitor, health, poll)
    }

    #[test]
    fn healthy_push_keeps_baseline() {
        let (monitor, _, poll) = monitor(Some(Duration::from_secs(5)), true);
        let health = monitor.evaluate(Instant::now() + Duration::from_secs(30));

        assert!(health.push_ok);
        assert_eq!(health.poll_interval_ms, Some(5_000));
        assert_eq!(poll.interval(), Some(Duration::from_secs(5)));
        assert_eq!(health.latency_bound_ms, 5_000);
    }

    #[test]
    fn polling_accelerates_only_after_grace_period() {
        let (monitor, _, poll) = monitor(Some(Duration::from_secs(5)), false);
        let start = Instant::now();

        let within_grace = monitor.evaluate(start + Duration::from_secs(1));
        assert_eq!(within_grace.poll_interval_ms, Some(5_000));
        assert!(!within_grace.push_ok);

        let degraded = monitor.evaluate(start + Duration::from_secs(4));
        assert_eq!(degraded.poll_interval_ms, Some(1_000));
        assert_eq!(poll.interval(), Some(Duration::from_secs(1)));
        assert_eq!(degraded.latency_bound_ms, 3_250);
    }

    #[test]
    fn dormant_poll_wakes_when_degraded_and_sleeps_on_recovery() {
        let (monitor, health, poll) = monitor(None, false);
        let start = Instant::now();

        assert_eq!(monitor.evaluate(start).poll_interval_ms, None);
        assert_eq!(monitor.evaluate(start + Duration::from_secs(4)).poll_interval_ms, Some(1_000));

        health.mark_healthy();
        assert_eq!(monitor.evaluate(start + Duration::from_secs(5)).poll_interval_ms, None);
        assert_eq!(poll.interval(), None);
        assert_eq!(monitor.current_latency_bound(), Duration::from_millis(3_250));
    }

    #[test]
    fn evaluation_is_published() {
        let (monitor, _, _) = monitor(Some(Duration::from_secs(5)), true);
        let receiver = monitor.subscribe();
        monitor.evaluate(Instant::now());
        assert!(receiver.borrow().push_ok);
    }
}
