// =============================================================================
// Candle ring buffer — per-(symbol, interval) OHLCV history
// =============================================================================
//
// The forming (not yet final) bar is updated in place; a final bar becomes a
// permanent history entry and the ring is trimmed to capacity with plain FIFO
// eviction. Upserts are idempotent by open_time, so a replayed final bar for
// the same minute never produces a duplicate entry.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV bar, live or historical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    /// False while the bar is still forming; true once the interval closed.
    pub is_final: bool,
}

/// Identifies one candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    /// Upper-case symbol, e.g. "BTCUSDT".
    pub symbol: String,
    /// Interval token, e.g. "1m".
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: &str, interval: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            interval: interval.to_string(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// CandleBuffer
// ---------------------------------------------------------------------------

/// Thread-safe bounded buffer of recent candles per `(symbol, interval)`.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    capacity: usize,
}

impl CandleBuffer {
    /// `capacity` bounds the number of candles retained per key; the oldest
    /// is evicted on overflow.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Insert or replace. Last write wins for a given `open_time`, whether
    /// the bar is forming or a replayed final. A final bar older than the
    /// newest entry is historical backfill and merges into chronological
    /// position; an older forming bar is a pre-reconnect leftover and is
    /// dropped.
    pub fn upsert(&self, key: CandleKey, candle: Candle) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity + 1));

        if let Some(pos) = ring.iter().rposition(|c| c.open_time == candle.open_time) {
            ring[pos] = candle;
            return;
        }

        if ring.back().map_or(true, |last| last.open_time < candle.open_time) {
            ring.push_back(candle);
        } else if candle.is_final {
            let pos = ring.partition_point(|c| c.open_time < candle.open_time);
            ring.insert(pos, candle);
        } else {
            debug!(open_time = candle.open_time, "dropping stale forming bar");
            return;
        }

        // Capacity eviction always discards the oldest, so a merged bar that
        // lands at the front of a full ring is gone again immediately.
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    /// The most recent `count` final candles, oldest first.
    pub fn finals(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let finals: Vec<&Candle> = ring.iter().filter(|c| c.is_final).collect();
                let start = finals.len().saturating_sub(count);
                finals[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// The most recent `count` candles including the forming bar, oldest
    /// first.
    pub fn recent(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// The currently forming bar, if the newest entry is not final.
    pub fn forming(&self, key: &CandleKey) -> Option<Candle> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.back())
            .filter(|c| !c.is_final)
            .cloned()
    }

    /// Close price of the most recent final candle.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_final).map(|c| c.close))
    }

    /// Count of final candles stored for a key.
    pub fn final_count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key)
            .map_or(0, |ring| ring.iter().filter(|c| c.is_final).count())
    }

    /// Total entries stored for a key, forming bar included.
    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
