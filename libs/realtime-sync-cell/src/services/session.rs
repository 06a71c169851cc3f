//! A realtime session: one engine task, the adapters feeding it, and the
//! delivery monitor that keeps them honest.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::RealtimeError;
use crate::models::{CurrentHealth, Event, EventKind, Key, Notification, RealtimeConfig, SourceChannel, SOS_BROADCAST_CHANNEL};
use crate::services::adapters::{
    BroadcastAdapter, ChannelAdapter, EventSink, Inbound, PollAdapter, PushFeedAdapter, Subscription,
};
use crate::services::engine::ReconciliationEngine;
use crate::services::monitor::DeliveryMonitor;
use crate::services::normalize::{event_from_row, STATUS_RESOLVED};
use crate::services::transport::{FeedFilter, RealtimeBackends, WriteApi};

/// What a session listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionScope {
    /// Every active SOS alert; recipient side.
    SosAlerts,
    /// One consultation thread, as seen by `user_id`.
    Consultation { consultation_id: String, user_id: String },
}

impl SessionScope {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionScope::SosAlerts => EventKind::Sos,
            SessionScope::Consultation { .. } => EventKind::ChatMessage,
        }
    }

    fn feed_filter(&self) -> FeedFilter {
        match self {
            SessionScope::SosAlerts => FeedFilter::new(EventKind::Sos.table()),
            SessionScope::Consultation { consultation_id, .. } => {
                FeedFilter::new(EventKind::ChatMessage.table()).eq("consultation_id", consultation_id)
            }
        }
    }

    fn poll_filter(&self) -> FeedFilter {
        match self {
            SessionScope::SosAlerts => self.feed_filter().eq("status", "active"),
            SessionScope::Consultation { .. } => self.feed_filter(),
        }
    }
}

impl fmt::Display for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionScope::SosAlerts => write!(f, "sos-alerts"),
            SessionScope::Consultation { consultation_id, .. } => write!(f, "consultation-{}", consultation_id),
        }
    }
}

#[derive(Debug)]
pub enum SessionCommand {
    Inbound(Inbound),
    RegisterOptimistic(Event),
    FailOptimistic { local_id: String, reason: String },
    Resolve { key: Key, row: Option<Event> },
    Prime(Vec<Event>),
}

/// Consumer side of a session. Yields nothing once the session is torn down,
/// even if notifications were still queued.
pub struct NotificationReceiver {
    receiver: mpsc::UnboundedReceiver<Notification>,
    closed: Arc<AtomicBool>,
}

impl NotificationReceiver {
    pub async fn recv(&mut self) -> Option<Notification> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let notification = self.receiver.recv().await?;
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(notification)
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.receiver.try_recv().ok()
    }
}

struct Running {
    adapters: Vec<(Box<dyn ChannelAdapter>, Subscription)>,
    engine_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Running {
    /// Signals shutdown and stops the adapters. Returns the engine task, which
    /// exits on its own once it observes the signal.
    fn stop(self) -> JoinHandle<()> {
        let _ = self.shutdown.send(true);
        for (adapter, subscription) in self.adapters {
            adapter.stop(subscription);
        }
        self.monitor_task.abort();
        self.engine_task
    }
}

pub struct RealtimeSession {
    scope: SessionScope,
    write: Arc<dyn WriteApi>,
    optimistic_timeout: Duration,
    commands: mpsc::UnboundedSender<SessionCommand>,
    health: watch::Receiver<CurrentHealth>,
    monitor: Arc<DeliveryMonitor>,
    closed: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
}

impl RealtimeSession {
    /// Starts adapters, monitor and engine. Must be called inside a Tokio runtime.
    pub fn start(scope: SessionScope, backends: &RealtimeBackends, config: RealtimeConfig) -> (Self, NotificationReceiver) {
        let kind = scope.kind();
        let closed = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (notifications, notification_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let push = PushFeedAdapter::new(kind, backends.push.clone(), scope.feed_filter(), config.push_retry_delay);
        let poll = PollAdapter::new(kind, backends.query.clone(), scope.poll_filter(), &config);
        let monitor = Arc::new(DeliveryMonitor::new(&config, push.health(), poll.control()));

        let mut adapters: Vec<Box<dyn ChannelAdapter>> = vec![Box::new(push), Box::new(poll)];
        if let (SessionScope::SosAlerts, Some(bus)) = (&scope, &backends.broadcast) {
            adapters.push(Box::new(BroadcastAdapter::new(bus.clone(), SOS_BROADCAST_CHANNEL, config.push_retry_delay)));
        }

        let engine_task = tokio::spawn(run_engine(
            ReconciliationEngine::new(&config),
            command_rx,
            notifications,
            shutdown_rx.clone(),
            closed.clone(),
        ));
        let monitor_task = tokio::spawn(monitor.clone().run(shutdown_rx));

        let adapters = adapters
            .into_iter()
            .map(|adapter| {
                let sink = EventSink::from_channel(commands.clone(), SessionCommand::Inbound);
                let subscription = adapter.start(sink);
                (adapter, subscription)
            })
            .collect();

        info!("Realtime session {} started", scope);

        let session = Self {
            scope,
            write: backends.write.clone(),
            optimistic_timeout: config.optimistic_timeout,
            commands,
            health: monitor.subscribe(),
            monitor,
            closed: closed.clone(),
            running: Mutex::new(Some(Running { adapters, engine_task, monitor_task, shutdown })),
        };
        let receiver = NotificationReceiver { receiver: notification_rx, closed };

        (session, receiver)
    }

    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }

    /// Registers a chat message as pending. The caller renders the returned
    /// event right away and then calls [`PendingSend::commit`].
    pub fn send_optimistic(&self, text: &str) -> Result<PendingSend, RealtimeError> {
        let SessionScope::Consultation { consultation_id, user_id } = &self.scope else {
            return Err(RealtimeError::Unsupported("optimistic sends are only available in chat sessions".to_string()));
        };
        if self.is_closed() {
            return Err(RealtimeError::SessionClosed);
        }

        let mut payload = Map::new();
        payload.insert("consultation_id".to_string(), Value::from(consultation_id.as_str()));
        payload.insert("message".to_string(), Value::from(text));

        let event = Event::provisional(
            format!("opt-{}", Uuid::new_v4()),
            EventKind::ChatMessage,
            user_id.as_str(),
            payload,
            Utc::now(),
            SourceChannel::Optimistic,
        );

        self.commands
            .send(SessionCommand::RegisterOptimistic(event.clone()))
            .map_err(|_| RealtimeError::SessionClosed)?;

        Ok(PendingSend {
            event,
            write: self.write.clone(),
            commands: self.commands.clone(),
            timeout: self.optimistic_timeout,
        })
    }

    /// Marks an SOS alert resolved and stops alerting for it.
    #[instrument(skip(self))]
    pub async fn resolve(&self, logical_id: &str) -> Result<(), RealtimeError> {
        if self.scope.kind() != EventKind::Sos {
            return Err(RealtimeError::Unsupported("only SOS alerts can be resolved".to_string()));
        }
        if self.is_closed() {
            return Err(RealtimeError::SessionClosed);
        }

        let row = self
            .write
            .update(EventKind::Sos.table(), logical_id, json!({ "status": STATUS_RESOLVED }))
            .await?;

        info!("SOS alert {} resolved", logical_id);
        let command = SessionCommand::Resolve {
            key: Key::logical(EventKind::Sos, logical_id),
            row: event_from_row(EventKind::Sos, &row, SourceChannel::Push).ok(),
        };
        self.commands.send(command).map_err(|_| RealtimeError::SessionClosed)
    }

    /// Loads already rendered history so later copies of it are not re-emitted.
    /// Returns the primed events.
    pub fn prime(&self, rows: &[Value]) -> Result<Vec<Event>, RealtimeError> {
        if self.is_closed() {
            return Err(RealtimeError::SessionClosed);
        }

        let kind = self.scope.kind();
        let events: Vec<Event> = rows
            .iter()
            .filter_map(|row| match event_from_row(kind, row, SourceChannel::Poll) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Skipping history row for {}: {}", self.scope, e);
                    None
                }
            })
            .collect();

        debug!("Priming {} with {} events", self.scope, events.len());
        self.commands
            .send(SessionCommand::Prime(events.clone()))
            .map_err(|_| RealtimeError::SessionClosed)?;
        Ok(events)
    }

    pub fn current_health(&self) -> CurrentHealth {
        *self.health.borrow()
    }

    pub fn current_latency_bound(&self) -> Duration {
        self.monitor.current_latency_bound()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops every adapter and discards all reconciliation state. Idempotent.
    #[instrument(skip(self), fields(scope = %self.scope))]
    pub async fn teardown(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(running) = running else {
            return;
        };

        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = running.stop().await {
            warn!("Engine task for {} ended abnormally: {}", self.scope, e);
        }

        info!("Realtime session {} torn down", self.scope);
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = running {
            self.closed.store(true, Ordering::SeqCst);
            running.stop().abort();
            debug!("Realtime session {} dropped without teardown", self.scope);
        }
    }
}

/// A registered optimistic send whose authoritative write has not happened yet.
pub struct PendingSend {
    event: Event,
    write: Arc<dyn WriteApi>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    timeout: Duration,
}

impl PendingSend {
    pub fn local_id(&self) -> &str {
        self.event.display_id()
    }

    /// The provisional envelope to render until it is upgraded.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Performs the authoritative write. Confirmation itself arrives through
    /// the channels as an `upgrade`; a rejected or hung write surfaces as an
    /// `error` notification for this send.
    pub async fn commit(self) -> Result<(), RealtimeError> {
        let local_id = self.local_id().to_string();
        let fields = json!({
            "consultation_id": self.event.payload.get("consultation_id").cloned().unwrap_or(Value::Null),
            "sender_id": self.event.origin_id,
            "message": self.event.payload.get("message").cloned().unwrap_or(Value::Null),
        });

        let write = self.write.insert(EventKind::ChatMessage.table(), fields);
        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(row)) => {
                debug!("Send {} stored as {}", local_id, row.get("id").unwrap_or(&serde_json::Value::Null));
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Send {} was rejected: {}", local_id, e);
                let reason = e.to_string();
                self.fail(&local_id, &reason);
                Err(RealtimeError::WriteFailure { local_id, reason })
            }
            Err(_) => {
                error!("Send {} timed out after {:?}", local_id, self.timeout);
                self.fail(&local_id, "write timed out");
                Err(RealtimeError::ConfirmTimeout { local_id })
            }
        }
    }

    fn fail(&self, local_id: &str, reason: &str) {
        let command = SessionCommand::FailOptimistic {
            local_id: local_id.to_string(),
            reason: reason.to_string(),
        };
        if self.commands.send(command).is_err() {
            debug!("Session closed before send {} failed", local_id);
        }
    }
}

async fn run_engine(
    mut engine: ReconciliationEngine,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    notifications: mpsc::UnboundedSender<Notification>,
    mut shutdown: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
) {
    loop {
        let deadline = engine.next_deadline().map(tokio::time::Instant::from_std);

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            command = commands.recv() => match command {
                Some(command) => apply(&mut engine, command),
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {}
        }

        if closed.load(Ordering::SeqCst) {
            break;
        }
        for notification in engine.drain(Instant::now()) {
            if notifications.send(notification).is_err() {
                debug!("Notification receiver dropped");
            }
        }
    }

    let stats = engine.stats();
    engine.close();
    info!(
        "Engine stopped: {} inserts, {} upgrades, {} errors, {} duplicates",
        stats.inserts, stats.upgrades, stats.errors, stats.duplicates
    );
}

fn apply(engine: &mut ReconciliationEngine, command: SessionCommand) {
    let now = Instant::now();
    match command {
        SessionCommand::Inbound(Inbound::Event(event)) => engine.ingest(event, now),
        SessionCommand::Inbound(Inbound::Resolved { key, event }) => engine.resolve(key, event.as_ref(), now),
        SessionCommand::RegisterOptimistic(event) => {
            if let Err(e) = engine.register_optimistic(event, now) {
                warn!("Could not register optimistic send: {}", e);
            }
        }
        SessionCommand::FailOptimistic { local_id, reason } => {
            if !engine.fail_optimistic(&local_id, &reason, now) {
                debug!("Send {} already settled", local_id);
            }
        }
        SessionCommand::Resolve { key, row } => engine.resolve(key, row.as_ref(), now),
        SessionCommand::Prime(events) => {
            for event in events {
                engine.prime(event, now);
            }
        }
    }
}
