// =============================================================================
// Message dispatcher — decode inbound frames and route them to consumers
// =============================================================================
//
// One dispatcher loop per connection, and it is the only reader: the read
// half is moved in by value, so a second concurrent reader cannot exist.
// Frames are decoded once at this boundary into a tagged `InboundFrame` and
// routed; a malformed frame is logged and dropped, never fatal.
//
// Liveness: after `read_timeout` of silence a ping probe goes out; if the
// socket stays silent through the probe window the session is declared lost.
// The loop exits with a `DisconnectReason` and the supervisor decides what
// delay class the reconnect takes.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::market_data::{Candle, CandleBuffer, CandleKey, TickerBoard};
use crate::runtime_config::StreamTuning;
use crate::stream::connection::{ConnectionManager, WsReader};
use crate::stream::pending::PendingRequests;

// =============================================================================
// Inbound frame model
// =============================================================================

/// A ticker update carried by a `<symbol>@ticker` event or one element of a
/// `!ticker@arr` batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerUpdate {
    pub symbol: String,
    pub price: f64,
}

/// Every inbound frame kind the feed understands, decoded exactly once.
#[derive(Debug)]
pub enum InboundFrame {
    /// Acknowledgement of a subscribe/unsubscribe request.
    Ack { id: u64 },
    /// One kline event (forming or final bar).
    Kline { key: CandleKey, candle: Candle },
    /// One or more ticker updates.
    Tickers(Vec<TickerUpdate>),
    /// Parsed fine but not a shape we route.
    Unrecognized,
}

/// Why the dispatcher loop ended. Drives the supervisor's delay class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed with a policy-violation code (rate limited / banned).
    PeerPolicy,
    /// Peer closed normally or the stream ended.
    StreamEnded,
    /// Transport-level read error.
    ReadError,
    /// Silence outlasted the heartbeat probe.
    ProbeTimeout,
    /// Client shutdown requested.
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PeerPolicy => "peer policy violation",
            Self::StreamEnded => "stream ended",
            Self::ReadError => "read error",
            Self::ProbeTimeout => "probe timeout",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode one text frame. Handles the combined-stream envelope
/// `{"stream": ..., "data": {...}}`, bare single-stream payloads, ack
/// objects, and `!ticker@arr` arrays.
pub fn decode_frame(text: &str) -> Result<InboundFrame> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("frame is not valid JSON")?;

    if let Some(items) = root.as_array() {
        let updates = items
            .iter()
            .filter_map(|item| parse_ticker(item).ok())
            .collect::<Vec<_>>();
        return Ok(InboundFrame::Tickers(updates));
    }

    if !root.is_object() {
        return Ok(InboundFrame::Unrecognized);
    }

    // Ack frames carry an id plus either "result" or "error".
    if let Some(id) = root.get("id").and_then(|v| v.as_u64()) {
        if root.get("result").is_some() || root.get("error").is_some() {
            return Ok(InboundFrame::Ack { id });
        }
    }

    // Unwrap the combined-stream envelope when present.
    let data = root.get("data").unwrap_or(&root);

    match data.get("e").and_then(|v| v.as_str()) {
        Some("kline") => {
            let (key, candle) = parse_kline(data)?;
            Ok(InboundFrame::Kline { key, candle })
        }
        Some("24hrTicker") => Ok(InboundFrame::Tickers(vec![parse_ticker(data)?])),
        _ => Ok(InboundFrame::Unrecognized),
    }
}

/// Parse a kline event payload.
///
/// Expected shape (envelope already unwrapped):
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": ..., "o": "...", "x": false, ... } }
/// ```
fn parse_kline(data: &serde_json::Value) -> Result<(CandleKey, Candle)> {
    let symbol = data["s"].as_str().context("missing field s")?;
    let k = &data["k"];

    let interval = k["i"].as_str().context("missing field k.i")?;
    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let close_time = k["T"].as_i64().context("missing field k.T")?;
    let is_final = k["x"].as_bool().context("missing field k.x")?;

    let candle = Candle {
        open_time,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        close_time,
        is_final,
    };

    Ok((CandleKey::new(symbol, interval), candle))
}

/// Parse a 24hrTicker event payload (field "c" is the last price).
fn parse_ticker(data: &serde_json::Value) -> Result<TickerUpdate> {
    let symbol = data["s"].as_str().context("missing field s")?.to_uppercase();
    let price = parse_string_f64(&data["c"], "c")?;
    Ok(TickerUpdate { symbol, price })
}

/// Binance sends numeric values as JSON strings inside event payloads.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Routing
// =============================================================================

fn route(
    frame: InboundFrame,
    pending: &PendingRequests,
    candles: &CandleBuffer,
    tickers: &TickerBoard,
) {
    match frame {
        InboundFrame::Ack { id } => match pending.resolve(id) {
            Some(entry) => {
                debug!(id, kind = %entry.kind, streams = entry.streams.len(), "request acknowledged");
            }
            None => warn!(id, "ack for unknown or expired request id"),
        },
        InboundFrame::Kline { key, candle } => {
            debug!(key = %key, close = candle.close, is_final = candle.is_final, "candle update");
            candles.upsert(key, candle);
        }
        InboundFrame::Tickers(updates) => {
            for t in updates {
                tickers.update(&t.symbol, t.price);
            }
        }
        InboundFrame::Unrecognized => {
            debug!("dropping unrecognized frame");
        }
    }
}

// =============================================================================
// Dispatcher loop
// =============================================================================

/// Run the read loop for one session until shutdown or connection loss.
/// Restartable any number of times; each session gets a fresh reader.
pub async fn run(
    mut reader: WsReader,
    manager: &ConnectionManager,
    pending: &PendingRequests,
    candles: &CandleBuffer,
    tickers: &TickerBoard,
    tuning: &StreamTuning,
    mut shutdown: watch::Receiver<bool>,
) -> DisconnectReason {
    info!("dispatcher loop started");
    loop {
        let next = tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender means the client itself is gone.
                if changed.is_err() || *shutdown.borrow() {
                    return DisconnectReason::Shutdown;
                }
                continue;
            }
            next = timeout(tuning.read_timeout(), reader.next()) => next,
        };

        let item = match next {
            Ok(item) => item,
            Err(_) => {
                // Prolonged silence: probe the transport before giving up.
                warn!(
                    silence_secs = tuning.read_timeout_secs,
                    "no frames received — issuing heartbeat probe"
                );
                if manager.send_ping().await.is_err() {
                    manager.mark_disconnected();
                    return DisconnectReason::ProbeTimeout;
                }
                match timeout(tuning.probe_timeout(), reader.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        warn!("heartbeat probe went unanswered — dropping session");
                        manager.mark_disconnected();
                        return DisconnectReason::ProbeTimeout;
                    }
                }
            }
        };

        if let Some(reason) = handle_item(item, manager, pending, candles, tickers) {
            return reason;
        }
    }
}

/// Process one read result. Returns the disconnect reason when the session
/// is over, `None` to keep reading.
fn handle_item(
    item: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    manager: &ConnectionManager,
    pending: &PendingRequests,
    candles: &CandleBuffer,
    tickers: &TickerBoard,
) -> Option<DisconnectReason> {
    match item {
        Some(Ok(Message::Text(text))) => {
            match decode_frame(&text) {
                Ok(frame) => route(frame, pending, candles, tickers),
                Err(e) => warn!(error = %e, "failed to decode frame — dropping"),
            }
            None
        }
        // tungstenite answers pings automatically; pongs refresh liveness by
        // arriving at all.
        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {
            None
        }
        Some(Ok(Message::Close(frame))) => {
            manager.mark_disconnected();
            let policy = frame
                .as_ref()
                .map(|f| f.code == CloseCode::Policy)
                .unwrap_or(false);
            if policy {
                warn!(frame = ?frame, "peer closed with policy violation code");
                Some(DisconnectReason::PeerPolicy)
            } else {
                info!(frame = ?frame, "peer closed the connection");
                Some(DisconnectReason::StreamEnded)
            }
        }
        Some(Err(e)) => {
            warn!(error = %e, "websocket read error");
            manager.mark_disconnected();
            Some(DisconnectReason::ReadError)
        }
        None => {
            info!("websocket stream ended");
            manager.mark_disconnected();
            Some(DisconnectReason::StreamEnded)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::pending::RequestKind;
    use crate::stream::registry::StreamName;

    const KLINE_COMBINED: &str = r#"{
        "stream": "btcusdt@kline_1m",
        "data": {
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000,
                "T": 1700000059999,
                "i": "1m",
                "o": "37000.00",
                "h": "37050.00",
                "l": "36990.00",
                "c": "37020.00",
                "v": "123.456",
                "x": true
            }
        }
    }"#;

    #[test]
    fn decodes_combined_kline_envelope() {
        let frame = decode_frame(KLINE_COMBINED).unwrap();
        match frame {
            InboundFrame::Kline { key, candle } => {
                assert_eq!(key.symbol, "BTCUSDT");
                assert_eq!(key.interval, "1m");
                assert_eq!(candle.open_time, 1_700_000_000_000);
                assert!((candle.close - 37_020.0).abs() < f64::EPSILON);
                assert!(candle.is_final);
            }
            other => panic!("expected kline, got {other:?}"),
        }
    }

    #[test]
    fn decodes_bare_kline_payload() {
        let bare = r#"{
            "e": "kline", "s": "ETHUSDT",
            "k": { "t": 1, "T": 2, "i": "5m", "o": "1", "h": "2", "l": "0.5", "c": "1.5", "v": "10", "x": false }
        }"#;
        match decode_frame(bare).unwrap() {
            InboundFrame::Kline { key, candle } => {
                assert_eq!(key.to_string(), "ETHUSDT@5m");
                assert!(!candle.is_final);
            }
            other => panic!("expected kline, got {other:?}"),
        }
    }

    #[test]
    fn decodes_ack_frame() {
        match decode_frame(r#"{"result": null, "id": 7}"#).unwrap() {
            InboundFrame::Ack { id } => assert_eq!(id, 7),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn decodes_single_ticker_event() {
        let text = r#"{"e": "24hrTicker", "s": "btcusdt", "c": "37011.5"}"#;
        match decode_frame(text).unwrap() {
            InboundFrame::Tickers(updates) => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].symbol, "BTCUSDT");
                assert!((updates[0].price - 37_011.5).abs() < f64::EPSILON);
            }
            other => panic!("expected tickers, got {other:?}"),
        }
    }

    #[test]
    fn decodes_ticker_array() {
        let text = r#"[
            {"e": "24hrTicker", "s": "BTCUSDT", "c": "1.0"},
            {"e": "24hrTicker", "s": "ETHUSDT", "c": "2.0"},
            {"e": "24hrTicker", "s": "BAD"}
        ]"#;
        match decode_frame(text).unwrap() {
            // The element missing its price is skipped, not fatal.
            InboundFrame::Tickers(updates) => assert_eq!(updates.len(), 2),
            other => panic!("expected tickers, got {other:?}"),
        }
    }

    #[test]
    fn disconnect_reason_renders_for_logging() {
        assert_eq!(DisconnectReason::PeerPolicy.to_string(), "peer policy violation");
        assert_eq!(DisconnectReason::ProbeTimeout.to_string(), "probe timeout");
        assert_eq!(DisconnectReason::Shutdown.to_string(), "shutdown");
    }

    #[test]
    fn unknown_event_is_unrecognized() {
        assert!(matches!(
            decode_frame(r#"{"e": "depthUpdate", "s": "BTCUSDT"}"#).unwrap(),
            InboundFrame::Unrecognized
        ));
    }

    #[test]
    fn malformed_json_is_an_error_not_a_panic() {
        assert!(decode_frame("{not json").is_err());
        assert!(decode_frame(r#"{"e": "kline", "s": "X", "k": {}}"#).is_err());
    }

    #[test]
    fn routing_updates_consumer_state() {
        let pending = PendingRequests::new(std::time::Duration::from_secs(30));
        let candles = CandleBuffer::new(10);
        let tickers = TickerBoard::new();

        // Kline frame lands in the candle buffer.
        let frame = decode_frame(KLINE_COMBINED).unwrap();
        route(frame, &pending, &candles, &tickers);
        let key = CandleKey::new("BTCUSDT", "1m");
        assert_eq!(candles.final_count(&key), 1);
        assert_eq!(candles.last_close(&key), Some(37_020.0));

        // Ack resolves the matching pending request.
        let id = pending.register(RequestKind::Subscribe, &[StreamName::ticker("btcusdt")]);
        let ack = decode_frame(&format!(r#"{{"result": null, "id": {id}}}"#)).unwrap();
        route(ack, &pending, &candles, &tickers);
        assert!(pending.is_empty());

        // Ticker frame lands in the price board.
        let t = decode_frame(r#"{"e": "24hrTicker", "s": "ETHUSDT", "c": "2000"}"#).unwrap();
        route(t, &pending, &candles, &tickers);
        assert_eq!(tickers.get("ETHUSDT").unwrap().price, 2000.0);
    }
}
