//! Per-session reconciliation of envelopes arriving from every channel.
//!
//! The engine is a synchronous state machine owned by exactly one task. It
//! decides, for each envelope, whether the consumer has to see an `insert`, an
//! `upgrade` of something already rendered, or nothing at all. Notifications
//! are queued in an outbox and handed out by [`ReconciliationEngine::drain`]
//! in `(created_at, id)` order.
//!
//! Every remembered key is forgotten once it has not been sighted for a full
//! recency window. Polls never return rows older than that window, so a
//! forgotten key cannot come back through the backstop.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RealtimeError;
use crate::models::{Event, EventKind, Key, Notification, RealtimeConfig};
use crate::services::identity::{content_match, identity_of};
use crate::services::ledger::{LedgerHandle, OptimisticLedger};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub inserts: u64,
    pub upgrades: u64,
    pub errors: u64,
    pub duplicates: u64,
}

#[derive(Debug)]
struct Queued {
    due: Instant,
    /// Set for held provisional inserts so an authoritative copy can replace them.
    held_key: Option<Key>,
    notification: Notification,
}

/// Keys with the instant they were last sighted.
#[derive(Debug, Default)]
struct SeenKeys {
    keys: HashMap<Key, Instant>,
}

impl SeenKeys {
    /// Records a sighting. Returns `true` when the key was not known yet.
    fn insert(&mut self, key: Key, now: Instant) -> bool {
        self.keys.insert(key, now).is_none()
    }

    fn contains(&self, key: &Key) -> bool {
        self.keys.contains_key(key)
    }

    fn forget_older_than(&mut self, now: Instant, retention: Duration) {
        self.keys.retain(|_, sighted| now.saturating_duration_since(*sighted) < retention);
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn clear(&mut self) {
        self.keys.clear();
    }
}

#[derive(Debug)]
pub struct ReconciliationEngine {
    optimistic_timeout: Duration,
    provisional_hold: Duration,
    recency_window: Duration,
    seen: SeenKeys,
    provisional_seen: SeenKeys,
    resolved: SeenKeys,
    optimistic: OptimisticLedger,
    optimistic_handles: HashMap<String, LedgerHandle>,
    provisional: OptimisticLedger,
    recent_confirmed: HashMap<(EventKind, String), VecDeque<(Event, Instant)>>,
    outbox: Vec<Queued>,
    stats: EngineStats,
    closed: bool,
}

impl ReconciliationEngine {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            optimistic_timeout: config.optimistic_timeout,
            provisional_hold: config.provisional_hold,
            recency_window: config.recency_window,
            seen: SeenKeys::default(),
            provisional_seen: SeenKeys::default(),
            resolved: SeenKeys::default(),
            optimistic: OptimisticLedger::new(),
            optimistic_handles: HashMap::new(),
            provisional: OptimisticLedger::new(),
            recent_confirmed: HashMap::new(),
            outbox: Vec::new(),
            stats: EngineStats::default(),
            closed: false,
        }
    }

    /// Feeds one envelope from any channel.
    pub fn ingest(&mut self, mut event: Event, now: Instant) {
        if self.closed {
            return;
        }

        match identity_of(&event) {
            Some(key @ Key::Logical { .. }) => self.ingest_confirmed(key, event, now),
            Some(key @ Key::Provisional { .. }) => self.ingest_provisional(key, event, now),
            None => {
                // Unidentifiable copies are still surfaced.
                let local_id = format!("anon-{}", Uuid::new_v4());
                warn!("{} event from {} carried no id, surfacing as {}", event.kind, event.source_channel, local_id);
                event.local_id = Some(local_id.clone());
                let key = Key::provisional(event.kind, &local_id);
                self.ingest_provisional(key, event, now);
            }
        }
    }

    fn ingest_confirmed(&mut self, key: Key, event: Event, now: Instant) {
        if !self.seen.insert(key.clone(), now) {
            self.stats.duplicates += 1;
            debug!("Discarding duplicate {} from {}", key, event.source_channel);
            return;
        }

        if let Some(replaced) = self.optimistic.reconcile(&event) {
            self.optimistic_handles.remove(replaced.id());
            debug!("Optimistic {} confirmed as {}", replaced, key);
            self.enqueue(now, None, Notification::Upgrade { replaced, event });
            return;
        }

        if let Some(replaced) = self.provisional.reconcile(&event) {
            let held = self.outbox.iter().position(|queued| queued.held_key.as_ref() == Some(&replaced));
            match held {
                Some(position) => {
                    debug!("Held {} replaced by {} before release", replaced, key);
                    self.outbox.remove(position);
                    self.enqueue(now, None, Notification::Insert { event });
                }
                None => {
                    debug!("Provisional {} superseded by {}", replaced, key);
                    self.enqueue(now, None, Notification::Upgrade { replaced, event });
                }
            }
            return;
        }

        self.recent_confirmed
            .entry((event.kind, event.origin_id.clone()))
            .or_default()
            .push_back((event.clone(), now));
        self.enqueue(now, None, Notification::Insert { event });
    }

    fn ingest_provisional(&mut self, key: Key, event: Event, now: Instant) {
        if !self.provisional_seen.insert(key.clone(), now) {
            self.stats.duplicates += 1;
            debug!("Discarding duplicate provisional {}", key);
            return;
        }

        if self.absorb_late_copy(&event) {
            self.stats.duplicates += 1;
            debug!("Provisional {} arrived after its authoritative copy", key);
            return;
        }

        self.provisional.insert(event.clone(), now);
        self.enqueue(now + self.provisional_hold, Some(key), Notification::Insert { event });
    }

    /// Consumes the authoritative copy a late provisional one belongs to. A
    /// provisional copy of unknown origin is compared against every author.
    fn absorb_late_copy(&mut self, provisional: &Event) -> bool {
        let found = self
            .recent_confirmed
            .iter()
            .filter(|((kind, origin), _)| {
                *kind == provisional.kind && (provisional.origin_id.is_empty() || *origin == provisional.origin_id)
            })
            .find_map(|(bucket, confirmed)| {
                confirmed
                    .iter()
                    .rposition(|(event, _)| content_match(provisional, event))
                    .map(|position| (bucket.clone(), position))
            });
        let Some((bucket, position)) = found else {
            return false;
        };

        if let Some(confirmed) = self.recent_confirmed.get_mut(&bucket) {
            confirmed.remove(position);
            if confirmed.is_empty() {
                self.recent_confirmed.remove(&bucket);
            }
        }
        true
    }

    /// Tracks a locally originated send. The caller renders it; nothing is emitted.
    pub fn register_optimistic(&mut self, event: Event, now: Instant) -> Result<LedgerHandle, RealtimeError> {
        if self.closed {
            return Err(RealtimeError::SessionClosed);
        }
        let local_id = match (&event.logical_id, &event.local_id) {
            (None, Some(local_id)) => local_id.clone(),
            _ => {
                return Err(RealtimeError::Unsupported(
                    "optimistic events carry a local id and no server id".to_string(),
                ))
            }
        };

        let handle = self.optimistic.insert(event, now);
        self.optimistic_handles.insert(local_id, handle);
        Ok(handle)
    }

    /// Surfaces an `error` for a pending send. Returns `false` when the send was
    /// already confirmed, failed or expired.
    pub fn fail_optimistic(&mut self, local_id: &str, reason: &str, now: Instant) -> bool {
        let Some(handle) = self.optimistic_handles.remove(local_id) else {
            return false;
        };
        let Some(event) = self.optimistic.fail(handle) else {
            return false;
        };

        self.enqueue(now, None, Notification::Error {
            local_id: local_id.to_string(),
            event,
            reason: reason.to_string(),
        });
        true
    }

    /// Stops alerting for `key`: queued notifications for it are dropped and
    /// later copies are discarded. When the resolved row is known, a
    /// provisional copy of the same alert still waiting in the ledger is
    /// retired with it.
    pub fn resolve(&mut self, key: Key, row: Option<&Event>, now: Instant) {
        if self.closed {
            return;
        }

        let mut retired = vec![key.clone()];
        if let Some(replaced) = row.and_then(|row| self.provisional.reconcile(row)) {
            debug!("Provisional {} retired with resolved {}", replaced, key);
            retired.push(replaced);
        }

        self.outbox.retain(|queued| {
            identity_of(queued.notification.event()).map_or(true, |identity| !retired.contains(&identity))
        });
        self.seen.insert(key.clone(), now);
        self.resolved.insert(key, now);
    }

    pub fn is_resolved(&self, key: &Key) -> bool {
        self.resolved.contains(key)
    }

    /// Marks an already rendered authoritative event as seen without emitting it.
    pub fn prime(&mut self, event: Event, now: Instant) {
        if self.closed {
            return;
        }
        match identity_of(&event) {
            Some(key @ Key::Logical { .. }) => {
                if self.seen.insert(key, now) {
                    self.recent_confirmed
                        .entry((event.kind, event.origin_id.clone()))
                        .or_default()
                        .push_back((event, now));
                }
            }
            _ => debug!("Ignoring primed {} event without a server id", event.kind),
        }
    }

    /// Expires stale state and returns every notification due at `now`.
    pub fn drain(&mut self, now: Instant) -> Vec<Notification> {
        if self.closed {
            return Vec::new();
        }

        for (_, event) in self.optimistic.expire(now, self.optimistic_timeout) {
            let local_id = event.display_id().to_string();
            self.optimistic_handles.remove(&local_id);
            warn!("Send {} was not confirmed within {:?}", local_id, self.optimistic_timeout);
            self.enqueue(now, None, Notification::Error {
                local_id,
                event,
                reason: "not confirmed in time".to_string(),
            });
        }

        self.provisional.expire(now, self.recency_window);
        let window = self.recency_window;
        self.seen.forget_older_than(now, window);
        self.provisional_seen.forget_older_than(now, window);
        self.resolved.forget_older_than(now, window);
        self.recent_confirmed.retain(|_, events| {
            events.retain(|(_, at)| now.saturating_duration_since(*at) < window);
            !events.is_empty()
        });

        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.outbox)
            .into_iter()
            .partition(|queued| queued.due <= now);
        self.outbox = pending;

        due.sort_by(|a, b| {
            let (a, b) = (a.notification.event(), b.notification.event());
            a.created_at.cmp(&b.created_at).then_with(|| a.display_id().cmp(b.display_id()))
        });

        due.into_iter()
            .map(|queued| {
                match &queued.notification {
                    Notification::Insert { .. } => self.stats.inserts += 1,
                    Notification::Upgrade { .. } => self.stats.upgrades += 1,
                    Notification::Error { .. } => self.stats.errors += 1,
                }
                queued.notification
            })
            .collect()
    }

    /// Earliest instant at which [`drain`](Self::drain) has something new to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let outbox = self.outbox.iter().map(|queued| queued.due).min();
        let expiry = self.optimistic.oldest_inserted_at().map(|at| at + self.optimistic_timeout);
        match (outbox, expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Discards all state. Nothing is emitted afterwards.
    pub fn close(&mut self) {
        self.closed = true;
        self.seen.clear();
        self.provisional_seen.clear();
        self.resolved.clear();
        self.optimistic.clear();
        self.optimistic_handles.clear();
        self.provisional.clear();
        self.recent_confirmed.clear();
        self.outbox.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of remembered keys, across confirmed, provisional and resolved.
    pub fn tracked_keys(&self) -> usize {
        self.seen.len() + self.provisional_seen.len() + self.resolved.len()
    }

    pub fn pending_sends(&self) -> usize {
        self.optimistic.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    fn enqueue(&mut self, due: Instant, held_key: Option<Key>, notification: Notification) {
        self.outbox.push(Queued { due, held_key, notification });
    }
}
