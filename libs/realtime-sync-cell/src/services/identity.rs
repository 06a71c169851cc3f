use crate::models::{Event, Key};

/// Canonical identity of an envelope.
///
/// Envelopes with a server id get a logical key `(kind, logical_id)`. Envelopes
/// carrying only a client placeholder get a provisional key, which is resolved
/// through [`content_match`] rather than key comparison. Returns `None` when the
/// envelope carries neither id.
pub fn identity_of(event: &Event) -> Option<Key> {
    match (&event.logical_id, &event.local_id) {
        (Some(id), _) => Some(Key::logical(event.kind, id)),
        (None, Some(local_id)) => Some(Key::provisional(event.kind, local_id)),
        (None, None) => None,
    }
}

/// True when `confirmed` is the authoritative counterpart of `provisional`.
///
/// Kind and origin must agree, and every content field present in the
/// provisional copy must be equal in the confirmed one. Fields the provisional
/// copy lacks are not compared, and an empty provisional origin (a broadcast
/// that did not name its author) matches any origin. Two distinct sends with
/// identical content from the same origin are indistinguishable here.
pub fn content_match(provisional: &Event, confirmed: &Event) -> bool {
    if provisional.kind != confirmed.kind {
        return false;
    }
    if !provisional.origin_id.is_empty() && provisional.origin_id != confirmed.origin_id {
        return false;
    }

    let mut compared = 0;
    for field in provisional.kind.content_fields() {
        let Some(expected) = provisional.payload.get(*field) else {
            continue;
        };
        if confirmed.payload.get(*field) != Some(expected) {
            return false;
        }
        compared += 1;
    }

    // An empty provisional payload would otherwise match every event from its origin.
    compared > 0
}
