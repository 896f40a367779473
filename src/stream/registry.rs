// =============================================================================
// Subscription registry — the authoritative "what should be subscribed" set
// =============================================================================
//
// The registry is the single source of truth: the live socket's subscription
// set converges towards it after every reconnect, never the other way around.
// It is guarded by its own lock, independent of the socket, so edits succeed
// while disconnected. Entries keep insertion order so replay batches are
// deterministic.
// =============================================================================

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// =============================================================================
// StreamName
// =============================================================================

/// One logical subscription channel, e.g. `btcusdt@kline_1m` or
/// `ethusdt@ticker`. Lower-cased on construction — Binance stream names are
/// case-sensitive and always lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamName(String);

impl StreamName {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    /// Candlestick stream for a symbol and interval: `<symbol>@kline_<iv>`.
    pub fn kline(symbol: &str, interval: &str) -> Self {
        Self::new(format!("{}@kline_{}", symbol.to_lowercase(), interval))
    }

    /// 24 h rolling ticker stream for a symbol: `<symbol>@ticker`.
    pub fn ticker(symbol: &str) -> Self {
        Self::new(format!("{}@ticker", symbol.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// SubscriptionRegistry
// =============================================================================

/// Insertion-ordered set of wanted streams. Survives disconnects; cleared
/// only at client shutdown.
pub struct SubscriptionRegistry {
    entries: RwLock<Vec<StreamName>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Add a stream. Returns `true` if it was newly inserted, `false` if it
    /// was already present (safe no-op).
    pub fn insert(&self, stream: StreamName) -> bool {
        let mut entries = self.entries.write();
        if entries.contains(&stream) {
            return false;
        }
        entries.push(stream);
        true
    }

    /// Remove a stream. Returns `true` if it was present.
    pub fn remove(&self, stream: &StreamName) -> bool {
        let mut entries = self.entries.write();
        match entries.iter().position(|s| s == stream) {
            Some(idx) => {
                entries.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, stream: &StreamName) -> bool {
        self.entries.read().contains(stream)
    }

    /// Copy of all entries in insertion order. Replay works from this
    /// snapshot; concurrent edits do not enter an in-flight replay plan.
    pub fn snapshot(&self) -> Vec<StreamName> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry. Called on client shutdown only.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_name_is_normalized() {
        assert_eq!(StreamName::new(" BTCUSDT@Ticker ").as_str(), "btcusdt@ticker");
        assert_eq!(StreamName::kline("BTCUSDT", "1m").as_str(), "btcusdt@kline_1m");
        assert_eq!(StreamName::ticker("ethusdt").as_str(), "ethusdt@ticker");
    }

    #[test]
    fn insert_is_idempotent() {
        let reg = SubscriptionRegistry::new();
        assert!(reg.insert(StreamName::kline("BTCUSDT", "1m")));
        assert!(!reg.insert(StreamName::kline("btcusdt", "1m")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_missing_is_noop() {
        let reg = SubscriptionRegistry::new();
        assert!(!reg.remove(&StreamName::ticker("xrpusdt")));
        reg.insert(StreamName::ticker("xrpusdt"));
        assert!(reg.remove(&StreamName::ticker("XRPUSDT")));
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let reg = SubscriptionRegistry::new();
        reg.insert(StreamName::kline("ethusdt", "5m"));
        reg.insert(StreamName::ticker("btcusdt"));
        reg.insert(StreamName::kline("btcusdt", "1m"));

        let snap: Vec<String> = reg
            .snapshot()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        assert_eq!(
            snap,
            vec!["ethusdt@kline_5m", "btcusdt@ticker", "btcusdt@kline_1m"]
        );
    }

    #[test]
    fn clear_empties_registry() {
        let reg = SubscriptionRegistry::new();
        reg.insert(StreamName::ticker("btcusdt"));
        reg.clear();
        assert!(reg.is_empty());
    }
}
