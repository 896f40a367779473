// =============================================================================
// Market stream client — public facade over the streaming stack
// =============================================================================
//
// One explicitly constructed client owns the connection manager, subscription
// registry, pending-request table, resubscriber and market-data stores, and
// runs a single supervisor task that keeps the session alive: connect, replay
// the registry, run the dispatcher, classify the disconnect, back off, repeat.
//
// Subscription intent lives in the registry, not on the wire: `subscribe`
// records the stream first, so a send failure or reconnect never loses it.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::binance::BinanceRest;
use crate::market_data::{Candle, CandleBuffer, CandleKey, TickerBoard, TickerPrice};
use crate::runtime_config::{RuntimeConfig, StreamTuning};
use crate::stream::backoff::BackoffPolicy;
use crate::stream::connection::{ConnectionManager, ConnectionState};
use crate::stream::dispatcher::{self, DisconnectReason};
use crate::stream::error::StreamError;
use crate::stream::pending::{PendingRequests, RequestKind};
use crate::stream::registry::{StreamName, SubscriptionRegistry};
use crate::stream::resubscribe::Resubscriber;

pub struct MarketStreamClient {
    manager: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    pending: Arc<PendingRequests>,
    resubscriber: Arc<Resubscriber>,
    candles: Arc<CandleBuffer>,
    tickers: Arc<TickerBoard>,
    rest: BinanceRest,
    tuning: StreamTuning,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MarketStreamClient {
    pub fn new(config: &RuntimeConfig, rest: BinanceRest) -> Self {
        let tuning = config.stream.clone();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            manager: Arc::new(ConnectionManager::new(config.ws_url.clone(), tuning.clone())),
            registry: Arc::new(SubscriptionRegistry::new()),
            pending: Arc::new(PendingRequests::new(tuning.pending_ttl())),
            resubscriber: Arc::new(Resubscriber::new(&tuning)),
            candles: Arc::new(CandleBuffer::new(config.candle_capacity)),
            tickers: Arc::new(TickerBoard::new()),
            rest,
            tuning,
            shutdown_tx,
            supervisor: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the supervisor task. Idempotent: a second call while the
    /// supervisor is alive is a no-op.
    pub async fn connect(&self) {
        let mut guard = self.supervisor.lock().await;
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("supervisor already running");
            return;
        }

        let handle = tokio::spawn(supervise(
            Arc::clone(&self.manager),
            Arc::clone(&self.registry),
            Arc::clone(&self.pending),
            Arc::clone(&self.resubscriber),
            Arc::clone(&self.candles),
            Arc::clone(&self.tickers),
            self.tuning.clone(),
            self.shutdown_tx.subscribe(),
        ));
        *guard = Some(handle);
        info!("stream supervisor started");
    }

    /// Stop the supervisor, close the connection and clear the registry.
    /// The client cannot be reconnected after close.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.manager.close().await;

        if let Some(handle) = self.supervisor.lock().await.take() {
            match tokio::time::timeout(self.tuning.close_grace(), handle).await {
                Ok(_) => info!("supervisor stopped"),
                Err(_) => warn!("supervisor did not stop within grace period"),
            }
        }

        self.registry.clear();
        info!("stream client closed");
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }

    // -------------------------------------------------------------------------
    // Subscription management
    // -------------------------------------------------------------------------

    /// Register a stream and, when a session is live, send the subscribe
    /// request immediately. The registry entry survives a failed send; the
    /// next session replay will pick it up.
    pub async fn subscribe(&self, stream: StreamName) -> Result<(), StreamError> {
        if !self.registry.insert(stream.clone()) {
            debug!(stream = %stream, "already subscribed");
            return Ok(());
        }

        if self.manager.state() == ConnectionState::Connected {
            self.resubscriber
                .send_request(
                    self.manager.as_ref(),
                    &self.pending,
                    RequestKind::Subscribe,
                    std::slice::from_ref(&stream),
                )
                .await?;
        }
        info!(stream = %stream, "subscribed");
        Ok(())
    }

    /// Drop a stream from the registry; the wire request is best effort.
    /// An unknown stream is a no-op.
    pub async fn unsubscribe(&self, stream: &StreamName) -> Result<(), StreamError> {
        if !self.registry.remove(stream) {
            return Ok(());
        }

        if self.manager.state() == ConnectionState::Connected {
            if let Err(e) = self
                .resubscriber
                .send_request(
                    self.manager.as_ref(),
                    &self.pending,
                    RequestKind::Unsubscribe,
                    std::slice::from_ref(stream),
                )
                .await
            {
                warn!(stream = %stream, error = %e, "unsubscribe request failed");
            }
        }
        info!(stream = %stream, "unsubscribed");
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<StreamName> {
        self.registry.snapshot()
    }

    // -------------------------------------------------------------------------
    // Data access
    // -------------------------------------------------------------------------

    pub fn latest_price(&self, symbol: &str) -> Option<f64> {
        self.tickers.get(symbol).map(|t| t.price)
    }

    pub fn all_prices(&self) -> Vec<TickerPrice> {
        self.tickers.all()
    }

    /// Final candles for a symbol/interval, newest last. When the in-memory
    /// buffer holds fewer bars than asked for, the gap is backfilled over
    /// REST and folded into the buffer before answering.
    pub async fn candles(&self, symbol: &str, interval: &str, count: usize) -> Result<Vec<Candle>> {
        let key = CandleKey::new(symbol, interval);

        if self.candles.final_count(&key) < count {
            let fetched = self
                .rest
                .get_klines(symbol, interval, count.max(1))
                .await
                .with_context(|| format!("backfill failed for {key}"))?;
            debug!(key = %key, fetched = fetched.len(), "backfilled candles over REST");
            for candle in fetched {
                self.candles.upsert(key.clone(), candle);
            }
        }

        Ok(self.candles.finals(&key, count))
    }

    /// The still-forming candle for a symbol/interval, if one has streamed in.
    pub fn forming(&self, symbol: &str, interval: &str) -> Option<Candle> {
        self.candles.forming(&CandleKey::new(symbol, interval))
    }

    /// All symbols currently tradable on the exchange.
    pub async fn symbols(&self) -> Result<Vec<String>> {
        self.rest.get_symbols().await
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Keep one session alive until shutdown. Attempt and delay state is held in
/// this loop; every wait is cancellable by the shutdown signal.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    manager: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    pending: Arc<PendingRequests>,
    resubscriber: Arc<Resubscriber>,
    candles: Arc<CandleBuffer>,
    tickers: Arc<TickerBoard>,
    tuning: StreamTuning,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BackoffPolicy::new(&tuning);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let reader = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            result = manager.connect() => match result {
                Ok(Some(reader)) => reader,
                Ok(None) => {
                    // Connection is terminal (closed) or someone else holds
                    // a live session; either way this loop is done.
                    debug!("connect was a no-op — supervisor exiting");
                    break;
                }
                Err(e) => {
                    let delay = if e.is_rate_limited() {
                        backoff.penalty_delay()
                    } else {
                        backoff.next_delay()
                    };
                    warn!(
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "connect failed — backing off"
                    );
                    if wait_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            },
        };

        backoff.reset();
        info!("session established");

        // Replay runs alongside the read loop so acks stream straight into
        // the pending table. It is torn down with the session.
        let replay = {
            let manager = Arc::clone(&manager);
            let pending = Arc::clone(&pending);
            let resubscriber = Arc::clone(&resubscriber);
            let snapshot = registry.snapshot();
            tokio::spawn(async move {
                resubscriber
                    .replay(manager.as_ref(), &pending, &snapshot)
                    .await
            })
        };

        let reason = dispatcher::run(
            reader,
            &manager,
            &pending,
            &candles,
            &tickers,
            &tuning,
            shutdown.clone(),
        )
        .await;
        replay.abort();

        let delay = match reason {
            DisconnectReason::Shutdown => break,
            DisconnectReason::PeerPolicy => {
                let delay = backoff.penalty_delay();
                warn!(
                    retry_in_secs = delay.as_secs(),
                    "peer closed with a policy violation — penalty backoff"
                );
                delay
            }
            reason => {
                let delay = backoff.next_delay();
                warn!(
                    reason = %reason,
                    retry_in_secs = delay.as_secs(),
                    "session ended — reconnecting"
                );
                delay
            }
        };

        if wait_or_shutdown(delay, &mut shutdown).await {
            break;
        }
    }

    info!("supervisor finished");
}

/// Sleep for `delay` unless the shutdown flag is raised first. A dropped
/// sender counts as shutdown. Returns true when the wait was interrupted.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
