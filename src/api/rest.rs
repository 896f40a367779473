// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and serve in-memory market data only;
// historical gaps are backfilled on demand by the stream client. Everything
// here is read-only and unauthenticated.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::indicators::atr;
use crate::market_data::Candle;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/symbols", get(symbols))
        .route("/api/v1/price", get(price))
        .route("/api/v1/klines", get(klines))
        .route("/api/v1/atr", get(atr_endpoint))
        .route("/api/v1/atr/all", get(atr_all))
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, Json(body)).into_response()
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connection: String,
    symbols: Vec<String>,
    subscriptions: usize,
    uptime_secs: i64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = chrono::Utc::now();
    Json(HealthResponse {
        status: "ok",
        connection: state.client.state().to_string(),
        symbols: state.config.symbols.clone(),
        subscriptions: state.client.subscriptions().len(),
        uptime_secs: (now - state.started_at).num_seconds(),
        server_time: now.timestamp_millis(),
    })
}

// =============================================================================
// Symbols
// =============================================================================

async fn symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.client.symbols().await {
        Ok(symbols) => Json(serde_json::json!({
            "count": symbols.len(),
            "symbols": symbols,
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "symbol lookup failed");
            error_response(StatusCode::BAD_GATEWAY, format!("symbol lookup failed: {e}"))
        }
    }
}

// =============================================================================
// Price
// =============================================================================

#[derive(Deserialize)]
struct PriceQuery {
    symbol: Option<String>,
}

async fn price(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PriceQuery>,
) -> impl IntoResponse {
    match query.symbol {
        Some(symbol) => match state.client.latest_price(&symbol) {
            Some(price) => Json(serde_json::json!({
                "symbol": symbol.to_uppercase(),
                "price": price,
            }))
            .into_response(),
            None => error_response(
                StatusCode::NOT_FOUND,
                format!("no price for {symbol}; is its ticker stream subscribed?"),
            ),
        },
        None => Json(state.client.all_prices()).into_response(),
    }
}

// =============================================================================
// Klines
// =============================================================================

#[derive(Deserialize)]
struct KlinesQuery {
    symbol: String,
    #[serde(default = "default_interval")]
    interval: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_limit() -> usize {
    100
}

async fn klines(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KlinesQuery>,
) -> impl IntoResponse {
    let limit = query.limit.clamp(1, 1000);
    match state.client.candles(&query.symbol, &query.interval, limit).await {
        Ok(candles) => Json(serde_json::json!({
            "symbol": query.symbol.to_uppercase(),
            "interval": query.interval,
            "count": candles.len(),
            "candles": candles,
        }))
        .into_response(),
        Err(e) => {
            warn!(symbol = %query.symbol, error = %e, "kline lookup failed");
            error_response(StatusCode::BAD_GATEWAY, format!("kline lookup failed: {e}"))
        }
    }
}

// =============================================================================
// ATR
// =============================================================================

#[derive(Deserialize)]
struct AtrQuery {
    symbol: String,
    #[serde(default = "default_interval")]
    interval: String,
    #[serde(default = "default_atr_period")]
    period: usize,
}

fn default_atr_period() -> usize {
    atr::DEFAULT_PERIOD
}

async fn atr_endpoint(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AtrQuery>,
) -> impl IntoResponse {
    if query.period == 0 {
        return error_response(StatusCode::BAD_REQUEST, "period must be at least 1");
    }

    // One extra bar is needed for the first true range.
    let candles = match state
        .client
        .candles(&query.symbol, &query.interval, query.period + 1)
        .await
    {
        Ok(candles) => candles,
        Err(e) => {
            warn!(symbol = %query.symbol, error = %e, "atr backfill failed");
            return error_response(StatusCode::BAD_GATEWAY, format!("kline lookup failed: {e}"));
        }
    };

    match (
        atr::atr(&candles, query.period),
        atr::atr_pct(&candles, query.period),
    ) {
        (Some(value), Some(pct)) => Json(serde_json::json!({
            "symbol": query.symbol.to_uppercase(),
            "interval": query.interval,
            "period": query.period,
            "atr": value,
            "atr_pct": pct,
        }))
        .into_response(),
        _ => error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "not enough closed candles for period {} (have {})",
                query.period,
                candles.len()
            ),
        ),
    }
}

#[derive(Deserialize)]
struct AtrAllQuery {
    #[serde(default = "default_interval")]
    interval: String,
    #[serde(default = "default_atr_period")]
    period: usize,
}

/// ATR for every configured symbol at one interval. A symbol whose data is
/// unavailable yields a null entry instead of failing the whole batch.
async fn atr_all(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AtrAllQuery>,
) -> impl IntoResponse {
    if query.period == 0 {
        return error_response(StatusCode::BAD_REQUEST, "period must be at least 1");
    }

    let mut results = Vec::with_capacity(state.config.symbols.len());
    for symbol in &state.config.symbols {
        let entry = match state
            .client
            .candles(symbol, &query.interval, query.period + 1)
            .await
        {
            Ok(candles) => atr_entry(symbol, &candles, query.period),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "atr backfill failed");
                serde_json::json!({
                    "symbol": symbol.to_uppercase(),
                    "atr": null,
                    "error": e.to_string(),
                })
            }
        };
        results.push(entry);
    }

    Json(serde_json::json!({
        "interval": query.interval,
        "period": query.period,
        "count": results.len(),
        "results": results,
    }))
    .into_response()
}

fn atr_entry(symbol: &str, candles: &[Candle], period: usize) -> serde_json::Value {
    match (atr::atr(candles, period), atr::atr_pct(candles, period)) {
        (Some(value), Some(pct)) => serde_json::json!({
            "symbol": symbol.to_uppercase(),
            "atr": value,
            "atr_pct": pct,
        }),
        _ => serde_json::json!({
            "symbol": symbol.to_uppercase(),
            "atr": null,
            "error": format!("not enough closed candles for period {period}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            close_time: 0,
            is_final: true,
        }
    }

    #[test]
    fn atr_entry_carries_value_and_pct() {
        let candles: Vec<Candle> = (0..15).map(|_| bar(205.0, 195.0, 200.0)).collect();
        let entry = atr_entry("btcusdt", &candles, 14);
        assert_eq!(entry["symbol"], "BTCUSDT");
        assert!((entry["atr"].as_f64().unwrap() - 10.0).abs() < 0.5);
        assert!(entry["atr_pct"].as_f64().unwrap() > 0.0);
        assert!(entry.get("error").is_none());
    }

    #[test]
    fn atr_entry_with_too_little_data_is_null_not_fatal() {
        let candles: Vec<Candle> = (0..5).map(|_| bar(205.0, 195.0, 200.0)).collect();
        let entry = atr_entry("ethusdt", &candles, 14);
        assert_eq!(entry["symbol"], "ETHUSDT");
        assert!(entry["atr"].is_null());
        assert!(entry["error"].as_str().unwrap().contains("14"));
    }
}
