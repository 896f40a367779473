// =============================================================================
// Binance REST client — public market-data endpoints
// =============================================================================
//
// Only unsigned endpoints are used: exchangeInfo for the symbol universe,
// klines for historical backfill, ticker/price for spot prices. Retries are
// an explicit bounded loop with attempt and delay state; an HTTP 418/429
// answer is a ban/throttle signal and waits the penalty interval instead of
// the ordinary retry delay.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::market_data::Candle;

/// Ordinary transient-failure retries per request.
const MAX_RETRIES: u32 = 3;
/// Base delay for the ordinary retry cadence (doubles per attempt).
const RETRY_BASE: Duration = Duration::from_secs(1);
/// Wait after an HTTP 418/429 before the single penalty retry.
const PENALTY_WAIT: Duration = Duration::from_secs(60);

/// Binance REST API client for public market data.
#[derive(Debug, Clone)]
pub struct BinanceRest {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceRest {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// GET a JSON body with bounded retries. Attempt count and delay live in
    /// this loop — no recursion, predictable cancellation.
    async fn get_json(&self, path_and_query: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let mut delay = RETRY_BASE;

        for attempt in 0..=MAX_RETRIES {
            let last = attempt == MAX_RETRIES;

            let response = match self.client.get(&url).send().await {
                Ok(r) => r,
                Err(e) if !last => {
                    warn!(error = %e, attempt, url = %url, "request failed — retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("GET {url} failed"));
                }
            };

            let status = response.status();
            if status == StatusCode::IM_A_TEAPOT || status == StatusCode::TOO_MANY_REQUESTS {
                if last {
                    anyhow::bail!("GET {url} rate limited ({status}) after retries");
                }
                warn!(
                    status = status.as_u16(),
                    wait_secs = PENALTY_WAIT.as_secs(),
                    "REST rate limited — observing penalty wait"
                );
                tokio::time::sleep(PENALTY_WAIT).await;
                continue;
            }

            let body: serde_json::Value = response
                .json()
                .await
                .with_context(|| format!("failed to parse response body from {url}"))?;

            if !status.is_success() {
                anyhow::bail!("GET {url} returned {status}: {body}");
            }
            return Ok(body);
        }
        unreachable!("retry loop always returns or bails on the last attempt")
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/exchangeInfo — all symbols currently in TRADING status.
    pub async fn get_symbols(&self) -> Result<Vec<String>> {
        let body = self.get_json("/api/v3/exchangeInfo").await?;

        let symbols: Vec<String> = body["symbols"]
            .as_array()
            .context("exchangeInfo response missing 'symbols' array")?
            .iter()
            .filter(|s| s["status"].as_str() == Some("TRADING"))
            .filter_map(|s| s["symbol"].as_str().map(str::to_string))
            .collect();

        debug!(count = symbols.len(), "tradable symbols fetched");
        Ok(symbols)
    }

    /// GET /api/v3/klines — historical OHLCV bars, oldest first.
    ///
    /// Binance answers with arrays:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    /// The last row may still be the forming bar; a bar whose close time is
    /// in the future is marked not final.
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        let query = format!(
            "/api/v3/klines?symbol={}&interval={}&limit={}",
            symbol.to_uppercase(),
            interval,
            limit
        );
        let body = self.get_json(&query).await?;

        let raw = body.as_array().context("klines response is not an array")?;
        let candles = decode_kline_rows(raw, chrono::Utc::now().timestamp_millis())?;

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/ticker/price — current price for one symbol, or every
    /// symbol when `symbol` is `None`.
    pub async fn get_prices(&self, symbol: Option<&str>) -> Result<HashMap<String, f64>> {
        let query = match symbol {
            Some(s) => format!("/api/v3/ticker/price?symbol={}", s.to_uppercase()),
            None => "/api/v3/ticker/price".to_string(),
        };
        let body = self.get_json(&query).await?;

        let mut prices = HashMap::new();
        match &body {
            serde_json::Value::Array(items) => {
                for item in items {
                    if let (Some(sym), Ok(price)) =
                        (item["symbol"].as_str(), parse_str_f64(&item["price"]))
                    {
                        prices.insert(sym.to_string(), price);
                    }
                }
            }
            serde_json::Value::Object(_) => {
                let sym = body["symbol"].as_str().context("price response missing symbol")?;
                prices.insert(sym.to_string(), parse_str_f64(&body["price"])?);
            }
            _ => anyhow::bail!("unexpected ticker/price response shape: {body}"),
        }

        debug!(count = prices.len(), "prices fetched");
        Ok(prices)
    }
}

/// Decode the klines array-of-arrays. A row that is too short or carries
/// non-integer time fields is skipped with a warning rather than coined into
/// a bogus bar at time zero.
fn decode_kline_rows(rows: &[serde_json::Value], now_ms: i64) -> Result<Vec<Candle>> {
    let mut candles = Vec::with_capacity(rows.len());
    for entry in rows {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 7 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }
        let (Some(open_time), Some(close_time)) = (arr[0].as_i64(), arr[6].as_i64()) else {
            warn!("skipping kline entry with non-integer time fields");
            continue;
        };

        candles.push(Candle {
            open_time,
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
            close_time,
            is_final: close_time <= now_ms,
        });
    }
    Ok(candles)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_rows_with_bad_time_fields_are_skipped() {
        let rows = vec![
            // Valid closed bar.
            serde_json::json!([60_000, "1.0", "2.0", "0.5", "1.5", "10", 119_999]),
            // Too short.
            serde_json::json!([120_000, "1.0"]),
            // String where the open time belongs.
            serde_json::json!(["oops", "1.0", "2.0", "0.5", "1.5", "10", 179_999]),
            // Still-forming bar: close time after "now".
            serde_json::json!([180_000, "1.5", "2.5", "1.0", "2.0", "5", 239_999]),
        ];

        let candles = decode_kline_rows(&rows, 200_000).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, 60_000);
        assert!(candles[0].is_final);
        assert_eq!(candles[1].open_time, 180_000);
        assert!(!candles[1].is_final);
    }

    #[test]
    fn kline_row_that_is_not_an_array_is_an_error() {
        let rows = vec![serde_json::json!({"open": 1})];
        assert!(decode_kline_rows(&rows, 0).is_err());
    }

    #[test]
    fn parse_str_f64_accepts_both_shapes() {
        assert_eq!(parse_str_f64(&serde_json::json!("37000.5")).unwrap(), 37_000.5);
        assert_eq!(parse_str_f64(&serde_json::json!(42.0)).unwrap(), 42.0);
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
        assert!(parse_str_f64(&serde_json::json!("not a number")).is_err());
    }
}
