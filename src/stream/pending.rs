// =============================================================================
// Pending request tracking — correlation ids for subscribe/unsubscribe acks
// =============================================================================
//
// Every outbound SUBSCRIBE/UNSUBSCRIBE frame carries a locally generated,
// monotonically increasing id. The exchange acknowledges with
// `{"result": null, "id": <n>}`; the dispatcher resolves the matching entry
// here. Entries that never receive an ack (lost on a disconnect) are
// garbage-collected after a TTL the next time one is registered.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::stream::registry::StreamName;

/// What an outstanding request asked the exchange to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe => f.write_str("SUBSCRIBE"),
            Self::Unsubscribe => f.write_str("UNSUBSCRIBE"),
        }
    }
}

/// An outstanding request awaiting an ack frame.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub kind: RequestKind,
    pub streams: Vec<StreamName>,
    pub sent_at: Instant,
}

/// Table of in-flight subscribe/unsubscribe requests keyed by correlation id.
pub struct PendingRequests {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, PendingEntry>>,
    ttl: Duration,
}

impl PendingRequests {
    pub fn new(ttl: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record a new outstanding request and return the correlation id to put
    /// in the outbound frame. Expired entries are swept on each call.
    pub fn register(&self, kind: RequestKind, streams: &[StreamName]) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();

        let ttl = self.ttl;
        entries.retain(|stale_id, entry| {
            let keep = entry.sent_at.elapsed() < ttl;
            if !keep {
                debug!(id = stale_id, kind = %entry.kind, "dropping unacked request past TTL");
            }
            keep
        });

        entries.insert(
            id,
            PendingEntry {
                kind,
                streams: streams.to_vec(),
                sent_at: Instant::now(),
            },
        );
        id
    }

    /// Resolve an ack by id. Returns the entry if the id was known.
    pub fn resolve(&self, id: u64) -> Option<PendingEntry> {
        self.entries.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let pending = PendingRequests::new(Duration::from_secs(30));
        let streams = [StreamName::ticker("btcusdt")];
        let a = pending.register(RequestKind::Subscribe, &streams);
        let b = pending.register(RequestKind::Subscribe, &streams);
        assert!(b > a);
    }

    #[test]
    fn resolve_removes_entry() {
        let pending = PendingRequests::new(Duration::from_secs(30));
        let id = pending.register(RequestKind::Subscribe, &[StreamName::kline("btcusdt", "1m")]);
        assert_eq!(pending.len(), 1);

        let entry = pending.resolve(id).expect("entry should exist");
        assert_eq!(entry.kind, RequestKind::Subscribe);
        assert_eq!(entry.streams[0].as_str(), "btcusdt@kline_1m");
        assert!(pending.is_empty());

        assert!(pending.resolve(id).is_none());
    }

    #[test]
    fn stale_entries_are_swept_on_register() {
        let pending = PendingRequests::new(Duration::ZERO);
        let streams = [StreamName::ticker("btcusdt")];
        pending.register(RequestKind::Subscribe, &streams);
        // The zero TTL makes the first entry immediately stale; registering
        // again sweeps it.
        pending.register(RequestKind::Unsubscribe, &streams);
        assert_eq!(pending.len(), 1);
    }
}
