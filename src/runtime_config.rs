// =============================================================================
// Runtime Configuration — JSON-loadable feed settings
// =============================================================================
//
// Every tunable parameter of the feed lives here: which streams to open at
// startup, endpoint URLs, buffer capacity, and the full set of pacing and
// backoff constants for the streaming client. All fields carry
// `#[serde(default)]` so adding new fields never breaks loading an older
// config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
    ]
}

fn default_intervals() -> Vec<String> {
    vec!["1m".to_string(), "5m".to_string()]
}

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443/stream".to_string()
}

fn default_rest_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_candle_capacity() -> usize {
    500
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_cooldown_secs() -> u64 {
    10
}

fn default_backoff_base_secs() -> u64 {
    1
}

fn default_backoff_cap_secs() -> u64 {
    300
}

fn default_penalty_secs() -> u64 {
    60
}

fn default_close_grace_secs() -> u64 {
    5
}

fn default_batch_size() -> usize {
    5
}

fn default_inter_batch_delay_secs() -> u64 {
    2
}

fn default_global_pause_every() -> usize {
    5
}

fn default_global_pause_secs() -> u64 {
    30
}

fn default_pending_ttl_secs() -> u64 {
    30
}

// =============================================================================
// StreamTuning
// =============================================================================

/// Pacing, timeout, and backoff constants for the streaming client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamTuning {
    /// Handshake timeout for one connect attempt.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Silence on the socket before a heartbeat probe is issued.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// How long the probe may go unanswered before the session is dropped.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Minimum spacing between any two connection attempts.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    /// First penalty delay after a peer-signaled throttle/ban.
    #[serde(default = "default_penalty_secs")]
    pub penalty_secs: u64,
    /// Upper bound on graceful-close and supervisor-join waits.
    #[serde(default = "default_close_grace_secs")]
    pub close_grace_secs: u64,
    /// Streams per SUBSCRIBE frame during registry replay.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_inter_batch_delay_secs")]
    pub inter_batch_delay_secs: u64,
    /// A longer global pause is inserted after this many batches.
    #[serde(default = "default_global_pause_every")]
    pub global_pause_every: usize,
    #[serde(default = "default_global_pause_secs")]
    pub global_pause_secs: u64,
    /// Unacked subscribe/unsubscribe requests are swept after this long.
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            cooldown_secs: default_cooldown_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            penalty_secs: default_penalty_secs(),
            close_grace_secs: default_close_grace_secs(),
            batch_size: default_batch_size(),
            inter_batch_delay_secs: default_inter_batch_delay_secs(),
            global_pause_every: default_global_pause_every(),
            global_pause_secs: default_global_pause_secs(),
            pending_ttl_secs: default_pending_ttl_secs(),
        }
    }
}

impl StreamTuning {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn penalty(&self) -> Duration {
        Duration::from_secs(self.penalty_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_secs(self.inter_batch_delay_secs)
    }

    pub fn global_pause(&self) -> Duration {
        Duration::from_secs(self.global_pause_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Symbols to subscribe at startup.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Kline intervals opened per symbol at startup.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<String>,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    /// Final candles retained per (symbol, interval).
    #[serde(default = "default_candle_capacity")]
    pub candle_capacity: usize,
    /// Bind address for the accessor HTTP API.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub stream: StreamTuning,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialize via defaults")
    }
}

impl RuntimeConfig {
    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    /// Apply environment overrides: `PULSEFEED_SYMBOLS` (comma-separated)
    /// and `PULSEFEED_LISTEN_ADDR`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("PULSEFEED_SYMBOLS") {
            let symbols: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                info!(symbols = ?symbols, "symbols overridden from environment");
                self.symbols = symbols;
            }
        }
        if let Ok(addr) = std::env::var("PULSEFEED_LISTEN_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr.trim().to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.symbols, default_symbols());
        assert_eq!(config.candle_capacity, 500);
        assert_eq!(config.stream.cooldown(), Duration::from_secs(10));
        assert_eq!(config.stream.backoff_cap(), Duration::from_secs(300));
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{ "symbols": ["SOLUSDT"], "stream": { "batch_size": 2 } }"#,
        )
        .unwrap();
        assert_eq!(config.symbols, vec!["SOLUSDT"]);
        assert_eq!(config.stream.batch_size, 2);
        // Untouched tuning fields keep their defaults.
        assert_eq!(config.stream.penalty(), Duration::from_secs(60));
        assert_eq!(config.intervals, default_intervals());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = RuntimeConfig::default();
        let raw = serde_json::to_string(&config).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.ws_url, config.ws_url);
        assert_eq!(back.stream.batch_size, config.stream.batch_size);
    }
}
