// =============================================================================
// Connection manager — owns the websocket, its state machine, and all sends
// =============================================================================
//
// State machine:
//
//   Disconnected --connect()--> Connecting --(open)--> Connected
//   Connected --(error / peer close)--> Disconnected
//   any state --close()--> Closing --> Closed (terminal)
//
// The authoritative state lives in a `tokio::sync::watch` channel so other
// components react to transitions without polling. The write half of the
// socket sits behind an async mutex — the transport does not support
// concurrent writers, so every outbound frame funnels through `send_text`.
// The read half is handed out exactly once per session; moving it into the
// dispatcher task enforces the single-reader discipline by ownership.
// =============================================================================

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::runtime_config::StreamTuning;
use crate::stream::error::StreamError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Exclusive read half of a live session, consumed by the dispatcher loop.
pub type WsReader = SplitStream<WsStream>;

type WsWriter = SplitSink<WsStream, Message>;

// =============================================================================
// ConnectionState
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        };
        f.write_str(s)
    }
}

impl ConnectionState {
    /// Closing and Closed are terminal: no reconnect may follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

// =============================================================================
// ConnectionManager
// =============================================================================

/// Owns at most one live websocket at a time. There is exactly one instance
/// per client and at most one in-flight connect attempt (only the supervisor
/// calls `connect`).
pub struct ConnectionManager {
    url: String,
    tuning: StreamTuning,
    state_tx: watch::Sender<ConnectionState>,
    writer: Mutex<Option<WsWriter>>,
    last_attempt: Mutex<Option<Instant>>,
}

impl ConnectionManager {
    pub fn new(url: impl Into<String>, tuning: StreamTuning) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: url.into(),
            tuning,
            state_tx,
            writer: Mutex::new(None),
            last_attempt: Mutex::new(None),
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver for state transitions; never requires polling.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            // Closing may only advance to Closed; Closed is final. A connect
            // attempt that resolves after shutdown must not resurrect either.
            let closing_to_closed =
                *current == ConnectionState::Closing && next == ConnectionState::Closed;
            if current.is_terminal() && !closing_to_closed {
                debug!(from = %current, to = %next, "ignoring transition out of terminal state");
                return false;
            }
            debug!(from = %current, to = %next, "connection state transition");
            *current = next;
            true
        });
    }

    /// Establish a new session and return its exclusive read half.
    ///
    /// Idempotent no-op (returns `Ok(None)`) when already Connecting or
    /// Connected, and when the manager has been shut down. The minimum
    /// cooldown since the previous attempt is awaited internally, never
    /// surfaced as an error to the caller.
    pub async fn connect(&self) -> Result<Option<WsReader>, StreamError> {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("connect called while already connecting/connected — ignoring");
                return Ok(None);
            }
            s if s.is_terminal() => {
                debug!("connect called after shutdown — ignoring");
                return Ok(None);
            }
            _ => {}
        }

        self.observe_cooldown().await;

        self.set_state(ConnectionState::Connecting);
        info!(url = %self.url, "connecting to stream endpoint");

        let attempt = connect_async(&self.url);
        let ws = match timeout(self.tuning.connect_timeout(), attempt).await {
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(StreamError::ConnectTimeout);
            }
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(classify_connect_error(e));
            }
            Ok(Ok((ws, _response))) => ws,
        };

        let (write, read) = ws.split();
        {
            let mut writer = self.writer.lock().await;
            // close() may have run while the handshake was in flight. Holding
            // the writer lock for the check keeps close() from missing a
            // socket stored after it swept the slot.
            if self.state().is_terminal() {
                debug!("shutdown raced the handshake — discarding fresh socket");
                return Ok(None);
            }
            *writer = Some(write);
        }
        self.set_state(ConnectionState::Connected);
        info!("stream connection established");

        Ok(Some(read))
    }

    /// Enforce the minimum spacing between attempts. Tight retry loops on
    /// instantaneous failures would otherwise hammer the peer, so the wait
    /// happens here rather than being surfaced to the caller.
    async fn observe_cooldown(&self) {
        let mut last = self.last_attempt.lock().await;
        if let Some(prev) = *last {
            let cooldown = self.tuning.cooldown();
            let elapsed = prev.elapsed();
            if elapsed < cooldown {
                let wait = cooldown - elapsed;
                info!(wait_ms = wait.as_millis() as u64, "observing connection cooldown");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Send a text frame. Every outbound frame goes through here; the mutex
    /// serializes writers. A transport error drops the session.
    pub async fn send_text(&self, text: String) -> Result<(), StreamError> {
        self.send(Message::Text(text)).await
    }

    /// Transport-level heartbeat probe issued by the dispatcher after a read
    /// timeout.
    pub async fn send_ping(&self) -> Result<(), StreamError> {
        self.send(Message::Ping(Vec::new())).await
    }

    async fn send(&self, msg: Message) -> Result<(), StreamError> {
        if self.state() != ConnectionState::Connected {
            return Err(StreamError::NotConnected);
        }

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(StreamError::NotConnected)?;

        match sink.send(msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "transport write failed — dropping session");
                drop(writer);
                self.mark_disconnected();
                Err(StreamError::SendFailed(e.to_string()))
            }
        }
    }

    /// Record connection loss detected outside `send` (read error, peer
    /// close, probe timeout). No effect once shutdown has begun.
    pub fn mark_disconnected(&self) {
        self.state_tx.send_if_modified(|current| {
            if current.is_terminal() || *current == ConnectionState::Disconnected {
                return false;
            }
            debug!(from = %current, "marking connection lost");
            *current = ConnectionState::Disconnected;
            true
        });
    }

    /// Graceful shutdown. Always ends in Closed, whether or not the peer
    /// acknowledges the close frame within the grace period.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closing);

        let mut writer = self.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            let graceful = async {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            };
            if timeout(self.tuning.close_grace(), graceful).await.is_err() {
                warn!("graceful close timed out — abandoning socket");
            }
        }
        drop(writer);

        self.set_state(ConnectionState::Closed);
        info!("stream connection closed");
    }
}

/// Map a handshake failure to the right failure class. An HTTP 418 or 429
/// on the upgrade is a peer ban/throttle and must take the penalty cadence.
fn classify_connect_error(err: WsError) -> StreamError {
    match &err {
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 418 || status.as_u16() == 429 {
                return StreamError::RateLimited(format!("handshake rejected: {status}"));
            }
            StreamError::ConnectFailed(format!("http {status}"))
        }
        _ => StreamError::ConnectFailed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new("ws://127.0.0.1:1/stream", StreamTuning::default())
    }

    #[test]
    fn initial_state_is_disconnected() {
        assert_eq!(manager().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_while_disconnected_fails_with_not_connected() {
        let m = manager();
        let err = m.send_text("{}".to_string()).await.unwrap_err();
        assert!(matches!(err, StreamError::NotConnected));
    }

    #[tokio::test]
    async fn close_is_terminal_from_any_state() {
        let m = manager();
        m.close().await;
        assert_eq!(m.state(), ConnectionState::Closed);

        // Post-shutdown connect attempts are no-ops.
        let result = m.connect().await.expect("no-op, not an error");
        assert!(result.is_none());
        assert_eq!(m.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn closed_manager_cannot_republish_connected() {
        let m = manager();
        m.close().await;

        // A connect attempt that was mid-handshake when close() finished
        // would try to publish Connected; the state machine must refuse.
        m.set_state(ConnectionState::Connected);
        assert_eq!(m.state(), ConnectionState::Closed);
        m.set_state(ConnectionState::Disconnected);
        assert_eq!(m.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn mark_disconnected_does_not_resurrect_closed() {
        let m = manager();
        m.close().await;
        m.mark_disconnected();
        assert_eq!(m.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn state_transitions_are_observable() {
        let m = manager();
        let rx = m.watch_state();
        m.close().await;
        assert_eq!(*rx.borrow(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_delays_second_attempt_instead_of_rejecting() {
        let m = manager();

        // First attempt: no prior attempt on record, returns immediately.
        let before = Instant::now();
        m.observe_cooldown().await;
        assert_eq!(before.elapsed(), std::time::Duration::ZERO);

        // Second attempt right away: must wait out the full cooldown
        // internally rather than reject. The paused clock makes the sleep
        // exact.
        let before = Instant::now();
        m.observe_cooldown().await;
        assert_eq!(before.elapsed(), StreamTuning::default().cooldown());
    }
}
