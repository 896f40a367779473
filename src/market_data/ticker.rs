// =============================================================================
// Ticker board — latest price per symbol, last write wins
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Latest known price for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: f64,
    pub updated_at: DateTime<Utc>,
}

/// Single-slot-per-symbol price map fed by the ticker stream. Reads never
/// block on the stream: they return whatever is currently known, stale or
/// not.
pub struct TickerBoard {
    prices: RwLock<HashMap<String, TickerPrice>>,
}

impl TickerBoard {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Overwrite the slot for `symbol`. Later writes always win.
    pub fn update(&self, symbol: &str, price: f64) {
        let symbol = symbol.to_uppercase();
        self.prices.write().insert(
            symbol.clone(),
            TickerPrice {
                symbol,
                price,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, symbol: &str) -> Option<TickerPrice> {
        self.prices.read().get(&symbol.to_uppercase()).cloned()
    }

    /// All known prices, sorted by symbol for stable output.
    pub fn all(&self) -> Vec<TickerPrice> {
        let mut prices: Vec<TickerPrice> = self.prices.read().values().cloned().collect();
        prices.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        prices
    }

    pub fn len(&self) -> usize {
        self.prices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.read().is_empty()
    }
}

impl Default for TickerBoard {
    fn default() -> Self {
        Self::new()
    }
}
