use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::models::{Event, EventKind, Key};
use crate::services::identity::{content_match, identity_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LedgerHandle(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Bucket {
    kind: EventKind,
    origin_id: String,
}

impl Bucket {
    fn of(event: &Event) -> Self {
        Self {
            kind: event.kind,
            origin_id: event.origin_id.clone(),
        }
    }

    /// Entries whose author was not named.
    fn unknown_origin(kind: EventKind) -> Self {
        Self {
            kind,
            origin_id: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    handle: LedgerHandle,
    key: Key,
    event: Event,
    inserted_at: Instant,
}

/// Provisional entries waiting for their authoritative counterpart.
///
/// Entries are bucketed by `(kind, origin)` so a confirmed event is only ever
/// compared against copies from the same author, or against copies whose
/// author is unknown. Within a bucket, insertion order is preserved and the
/// newest matching entry wins.
#[derive(Debug, Default)]
pub struct OptimisticLedger {
    buckets: HashMap<Bucket, Vec<PendingEntry>>,
    index: HashMap<LedgerHandle, Bucket>,
    next_handle: u64,
}

impl OptimisticLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provisional envelope. Envelopes without any id are keyed by
    /// their handle.
    pub fn insert(&mut self, event: Event, now: Instant) -> LedgerHandle {
        self.next_handle += 1;
        let handle = LedgerHandle(self.next_handle);
        let key = identity_of(&event)
            .unwrap_or_else(|| Key::provisional(event.kind, &format!("ledger-{}", handle.0)));

        let bucket = Bucket::of(&event);
        self.index.insert(handle, bucket.clone());
        self.buckets.entry(bucket).or_default().push(PendingEntry {
            handle,
            key,
            event,
            inserted_at: now,
        });

        handle
    }

    /// Matches `confirmed` against the newest pending entry with equal content.
    /// Entries from the same origin are tried before entries of unknown origin.
    /// A matched entry leaves the ledger, so it can be replaced only once.
    pub fn reconcile(&mut self, confirmed: &Event) -> Option<Key> {
        let (bucket, position) = [Bucket::of(confirmed), Bucket::unknown_origin(confirmed.kind)]
            .into_iter()
            .find_map(|bucket| {
                let position = self
                    .buckets
                    .get(&bucket)?
                    .iter()
                    .rposition(|entry| content_match(&entry.event, confirmed))?;
                Some((bucket, position))
            })?;

        let entries = self.buckets.get_mut(&bucket)?;
        let entry = entries.remove(position);
        if entries.is_empty() {
            self.buckets.remove(&bucket);
        }
        self.index.remove(&entry.handle);

        Some(entry.key)
    }

    /// Drops a pending entry whose write failed. Returns the dropped envelope.
    pub fn fail(&mut self, handle: LedgerHandle) -> Option<Event> {
        let bucket = self.index.remove(&handle)?;
        let entries = self.buckets.get_mut(&bucket)?;
        let position = entries.iter().position(|entry| entry.handle == handle)?;
        let entry = entries.remove(position);
        if entries.is_empty() {
            self.buckets.remove(&bucket);
        }
        Some(entry.event)
    }

    /// Removes and returns every entry that has been pending for at least `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(LedgerHandle, Event)> {
        let mut expired = Vec::new();

        self.buckets.retain(|_, entries| {
            entries.retain(|entry| {
                if now.saturating_duration_since(entry.inserted_at) >= timeout {
                    expired.push((entry.handle, entry.event.clone()));
                    false
                } else {
                    true
                }
            });
            !entries.is_empty()
        });

        for (handle, _) in &expired {
            self.index.remove(handle);
        }
        expired.sort_by_key(|(handle, _)| *handle);
        expired
    }

    pub fn oldest_inserted_at(&self) -> Option<Instant> {
        self.buckets
            .values()
            .filter_map(|entries| entries.first().map(|entry| entry.inserted_at))
            .min()
    }

    pub fn contains(&self, handle: LedgerHandle) -> bool {
        self.index.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceChannel;
    use chrono::Utc;
    use serde_json::{json, Map, Value};

    fn payload(text: &str) -> Map<String, Value> {
        json!({"message": text}).as_object().cloned().unwrap_or_default()
    }

    fn optimistic(local_id: &str, origin: &str, text: &str) -> Event {
        Event::provisional(local_id, EventKind::ChatMessage, origin, payload(text), Utc::now(), SourceChannel::Optimistic)
    }

    fn confirmed(id: &str, origin: &str, text: &str) -> Event {
        Event::confirmed(id, EventKind::ChatMessage, origin, payload(text), Utc::now(), SourceChannel::Push)
    }

    #[test]
    fn reconcile_replaces_matching_entry_once() {
        let mut ledger = OptimisticLedger::new();
        let now = Instant::now();
        ledger.insert(optimistic("L1", "a", "hello"), now);

        let replaced = ledger.reconcile(&confirmed("R9", "a", "hello"));
        assert_eq!(replaced, Some(Key::provisional(EventKind::ChatMessage, "L1")));
        assert!(ledger.is_empty());

        assert_eq!(ledger.reconcile(&confirmed("R9", "a", "hello")), None);
    }

    #[test]
    fn newest_matching_entry_wins() {
        let mut ledger = OptimisticLedger::new();
        let now = Instant::now();
        ledger.insert(optimistic("L1", "a", "ok"), now);
        ledger.insert(optimistic("L2", "a", "ok"), now);

        assert_eq!(ledger.reconcile(&confirmed("R1", "a", "ok")).map(|k| k.id().to_string()), Some("L2".into()));
        assert_eq!(ledger.reconcile(&confirmed("R2", "a", "ok")).map(|k| k.id().to_string()), Some("L1".into()));
    }

    #[test]
    fn foreign_origin_is_not_matched() {
        let mut ledger = OptimisticLedger::new();
        ledger.insert(optimistic("L1", "a", "hello"), Instant::now());

        assert_eq!(ledger.reconcile(&confirmed("R9", "b", "hello")), None);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn unknown_origin_entry_matches_any_author() {
        let mut ledger = OptimisticLedger::new();
        let now = Instant::now();
        ledger.insert(optimistic("T1", "", "hello"), now);
        ledger.insert(optimistic("L1", "a", "hello"), now);

        assert_eq!(ledger.reconcile(&confirmed("R1", "a", "hello")).map(|k| k.id().to_string()), Some("L1".into()));
        assert_eq!(ledger.reconcile(&confirmed("R2", "b", "hello")).map(|k| k.id().to_string()), Some("T1".into()));
        assert!(ledger.is_empty());
    }

    #[test]
    fn failed_entry_cannot_match_later() {
        let mut ledger = OptimisticLedger::new();
        let handle = ledger.insert(optimistic("L1", "a", "hello"), Instant::now());

        let dropped = ledger.fail(handle).unwrap();
        assert_eq!(dropped.local_id.as_deref(), Some("L1"));
        assert!(!ledger.contains(handle));
        assert_eq!(ledger.reconcile(&confirmed("R9", "a", "hello")), None);
        assert!(ledger.fail(handle).is_none());
    }

    #[test]
    fn expire_returns_only_stale_entries() {
        let mut ledger = OptimisticLedger::new();
        let start = Instant::now();
        let old = ledger.insert(optimistic("L1", "a", "first"), start);
        let fresh = ledger.insert(optimistic("L2", "a", "second"), start + Duration::from_secs(8));

        let expired = ledger.expire(start + Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, old);
        assert!(ledger.contains(fresh));
        assert!(!ledger.contains(old));
    }

    #[test]
    fn clear_discards_everything() {
        let mut ledger = OptimisticLedger::new();
        ledger.insert(optimistic("L1", "a", "hello"), Instant::now());
        ledger.clear();
        assert!(ledger.is_empty());
        assert_eq!(ledger.reconcile(&confirmed("R9", "a", "hello")), None);
    }
}
