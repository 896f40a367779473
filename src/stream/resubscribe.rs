// =============================================================================
// Resubscription orchestrator — rate-limited registry replay
// =============================================================================
//
// Binance enforces strict per-connection subscription pacing. After every
// reconnect the whole registry is replayed in fixed-size batches with an
// inter-batch delay, and a longer global pause every N batches to stay under
// the per-minute message limit. A failed batch is recorded and the replay
// continues — partial failure never abandons the rest of the registry.
//
// The same frame helpers serve the live single-item path used by
// `subscribe`/`unsubscribe` while connected.
// =============================================================================

use serde_json::json;
use tracing::{info, warn};

use crate::runtime_config::StreamTuning;
use crate::stream::error::StreamError;
use crate::stream::pending::{PendingRequests, RequestKind};
use crate::stream::registry::StreamName;

/// Seam over the connection manager's outbound path so replay behaviour is
/// testable against a recording transport.
pub trait Outbound {
    fn send_frame(
        &self,
        text: String,
    ) -> impl std::future::Future<Output = Result<(), StreamError>> + Send;
}

impl Outbound for crate::stream::connection::ConnectionManager {
    async fn send_frame(&self, text: String) -> Result<(), StreamError> {
        self.send_text(text).await
    }
}

/// Build the wire frame for a subscribe/unsubscribe request:
/// `{"method": "SUBSCRIBE", "params": ["btcusdt@kline_1m", ...], "id": 7}`.
pub fn request_frame(kind: RequestKind, streams: &[StreamName], id: u64) -> String {
    let params: Vec<&str> = streams.iter().map(StreamName::as_str).collect();
    json!({
        "method": kind.to_string(),
        "params": params,
        "id": id,
    })
    .to_string()
}

/// Outcome of one full registry replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    /// Streams whose subscribe frame was handed to the transport.
    pub sent: usize,
    /// Streams whose batch failed to send; they stay in the registry and are
    /// retried on the next reconnect.
    pub failed: Vec<StreamName>,
}

impl ReplayReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Replays registry snapshots through the connection in paced batches.
pub struct Resubscriber {
    batch_size: usize,
    inter_batch_delay: std::time::Duration,
    global_pause_every: usize,
    global_pause: std::time::Duration,
}

impl Resubscriber {
    pub fn new(tuning: &StreamTuning) -> Self {
        Self {
            batch_size: tuning.batch_size.max(1),
            inter_batch_delay: tuning.inter_batch_delay(),
            global_pause_every: tuning.global_pause_every.max(1),
            global_pause: tuning.global_pause(),
        }
    }

    /// Replay `snapshot` in insertion order. The snapshot is fixed up front;
    /// registry edits made while a replay is running are applied by the
    /// normal live subscribe path, not spliced into this plan.
    pub async fn replay<T: Outbound>(
        &self,
        transport: &T,
        pending: &PendingRequests,
        snapshot: &[StreamName],
    ) -> ReplayReport {
        let mut report = ReplayReport::default();
        if snapshot.is_empty() {
            return report;
        }

        let batches = snapshot.chunks(self.batch_size).count();
        info!(
            streams = snapshot.len(),
            batches,
            batch_size = self.batch_size,
            "replaying subscription registry"
        );

        for (index, batch) in snapshot.chunks(self.batch_size).enumerate() {
            let id = pending.register(RequestKind::Subscribe, batch);
            let frame = request_frame(RequestKind::Subscribe, batch, id);

            match transport.send_frame(frame).await {
                Ok(()) => report.sent += batch.len(),
                Err(e) => {
                    warn!(
                        error = %e,
                        batch = index + 1,
                        streams = ?batch.iter().map(StreamName::as_str).collect::<Vec<_>>(),
                        "subscribe batch failed — continuing with remaining batches"
                    );
                    report.failed.extend_from_slice(batch);
                }
            }

            // Pace before the next batch: a long global pause every N
            // batches, the ordinary inter-batch delay otherwise.
            let sent_batches = index + 1;
            if sent_batches < batches {
                if sent_batches % self.global_pause_every == 0 {
                    info!(
                        after_batches = sent_batches,
                        pause_secs = self.global_pause.as_secs(),
                        "global pause between subscription batches"
                    );
                    tokio::time::sleep(self.global_pause).await;
                } else {
                    tokio::time::sleep(self.inter_batch_delay).await;
                }
            }
        }

        if report.is_partial() {
            warn!(
                sent = report.sent,
                failed = report.failed.len(),
                "registry replay finished with partial failure"
            );
        } else {
            info!(sent = report.sent, "registry replay complete");
        }
        report
    }

    /// Live single-item path: one request frame for a handful of streams,
    /// tracked in the pending table like any replay batch.
    pub async fn send_request<T: Outbound>(
        &self,
        transport: &T,
        pending: &PendingRequests,
        kind: RequestKind,
        streams: &[StreamName],
    ) -> Result<(), StreamError> {
        let id = pending.register(kind, streams);
        transport.send_frame(request_frame(kind, streams, id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Recording transport: logs every outbound frame with the paused-clock
    /// timestamp at which it was sent.
    #[derive(Default)]
    struct FrameLog {
        frames: Mutex<Vec<(Duration, String)>>,
        fail_indices: Vec<usize>,
        start: Mutex<Option<Instant>>,
    }

    impl FrameLog {
        fn frames(&self) -> Vec<String> {
            self.frames.lock().iter().map(|(_, f)| f.clone()).collect()
        }

        fn offsets(&self) -> Vec<Duration> {
            self.frames.lock().iter().map(|(at, _)| *at).collect()
        }
    }

    impl Outbound for FrameLog {
        async fn send_frame(&self, text: String) -> Result<(), StreamError> {
            let mut start = self.start.lock();
            let origin = *start.get_or_insert_with(Instant::now);
            let at = origin.elapsed();
            let index = {
                let mut frames = self.frames.lock();
                frames.push((at, text));
                frames.len() - 1
            };
            drop(start);
            if self.fail_indices.contains(&index) {
                return Err(StreamError::SendFailed("injected".into()));
            }
            Ok(())
        }
    }

    fn tuning(batch_size: usize, inter_secs: u64, every: usize, pause_secs: u64) -> StreamTuning {
        StreamTuning {
            batch_size,
            inter_batch_delay_secs: inter_secs,
            global_pause_every: every,
            global_pause_secs: pause_secs,
            ..StreamTuning::default()
        }
    }

    fn pending() -> PendingRequests {
        PendingRequests::new(Duration::from_secs(30))
    }

    fn streams(n: usize) -> Vec<StreamName> {
        (0..n)
            .map(|i| StreamName::kline(&format!("sym{i}usdt"), "1m"))
            .collect()
    }

    #[test]
    fn request_frame_shape() {
        let subj = [StreamName::kline("BTCUSDT", "1m"), StreamName::ticker("ETHUSDT")];
        let frame = request_frame(RequestKind::Subscribe, &subj, 42);
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["method"], "SUBSCRIBE");
        assert_eq!(v["id"], 42);
        assert_eq!(v["params"][0], "btcusdt@kline_1m");
        assert_eq!(v["params"][1], "ethusdt@ticker");
    }

    #[tokio::test(start_paused = true)]
    async fn two_streams_fit_two_batches_with_inter_batch_pacing() {
        let resub = Resubscriber::new(&tuning(1, 2, 5, 30));
        let log = FrameLog::default();
        let pending = pending();

        let snapshot = vec![
            StreamName::kline("btcusdt", "1m"),
            StreamName::ticker("ethusdt"),
        ];
        let report = resub.replay(&log, &pending, &snapshot).await;

        assert_eq!(report.sent, 2);
        assert!(!report.is_partial());

        let frames = log.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("btcusdt@kline_1m"));
        assert!(frames[1].contains("ethusdt@ticker"));

        // Second batch waits out the inter-batch delay.
        let offsets = log.offsets();
        assert_eq!(offsets[0], Duration::ZERO);
        assert_eq!(offsets[1], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn global_pause_every_n_batches() {
        // 6 single-stream batches, global pause after every 2nd batch.
        let resub = Resubscriber::new(&tuning(1, 1, 2, 10));
        let log = FrameLog::default();
        let pending = pending();

        resub.replay(&log, &pending, &streams(6)).await;

        let offsets = log.offsets();
        // Pacing: 0, +1s, +10s (global), +1s, +10s (global), +1s.
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(11),
                Duration::from_secs(12),
                Duration::from_secs(22),
                Duration::from_secs(23),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_continues_remaining_batches() {
        let resub = Resubscriber::new(&tuning(1, 1, 10, 30));
        let log = FrameLog {
            fail_indices: vec![1],
            ..FrameLog::default()
        };
        let pending = pending();

        let snapshot = streams(4);
        let report = resub.replay(&log, &pending, &snapshot).await;

        // All four frames attempted despite the failure in the middle.
        assert_eq!(log.frames().len(), 4);
        assert_eq!(report.sent, 3);
        assert_eq!(report.failed, vec![snapshot[1].clone()]);
        assert!(report.is_partial());
    }

    #[tokio::test(start_paused = true)]
    async fn five_streams_replay_in_registry_order() {
        let resub = Resubscriber::new(&tuning(2, 1, 5, 30));
        let log = FrameLog::default();
        let pending = pending();

        let snapshot = streams(5);
        resub.replay(&log, &pending, &snapshot).await;

        // 5 streams at batch size 2 -> 3 frames, order preserved.
        let joined = log.frames().join("\n");
        let mut last = 0;
        for s in &snapshot {
            let pos = joined.find(s.as_str()).expect("stream must appear in frame log");
            assert!(pos >= last, "streams must replay in insertion order");
            last = pos;
        }
        assert_eq!(log.frames().len(), 3);
    }

    #[tokio::test]
    async fn empty_snapshot_sends_nothing() {
        let resub = Resubscriber::new(&StreamTuning::default());
        let log = FrameLog::default();
        let report = resub.replay(&log, &pending(), &[]).await;
        assert_eq!(report.sent, 0);
        assert!(log.frames().is_empty());
    }
}
