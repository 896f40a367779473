// =============================================================================
// Reconnect backoff policy
// =============================================================================
//
// Three independent delay mechanisms:
//   - Exponential backoff: min(base * 2^attempt, cap) for ordinary failures.
//   - Cooldown: a fixed minimum spacing between any two connection attempts,
//     enforced by the connection manager regardless of backoff state.
//   - Penalty: a distinct, larger delay for peer-signaled throttling (close
//     code 1008, HTTP 418/429). Penalties escalate on their own counter so
//     repeated bans grow the delay faster than ordinary disconnects would.
// =============================================================================

use std::time::Duration;

use crate::runtime_config::StreamTuning;

/// Delay calculator for the supervising reconnect loop. Pure state machine,
/// no clocks or timers of its own.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    cooldown: Duration,
    penalty_base: Duration,
    attempt: u32,
    penalty_count: u32,
}

impl BackoffPolicy {
    pub fn new(tuning: &StreamTuning) -> Self {
        Self {
            base: tuning.backoff_base(),
            cap: tuning.backoff_cap(),
            cooldown: tuning.cooldown(),
            penalty_base: tuning.penalty(),
            attempt: 0,
            penalty_count: 0,
        }
    }

    /// Delay before the next attempt after an ordinary failure.
    /// Consecutive calls without a `reset` produce non-decreasing delays up
    /// to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Self::exponential(self.base, self.attempt, self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay before the next attempt after a peer-signaled throttle. Starts
    /// at the configured penalty (60 s by default) and doubles per repeated
    /// ban, capped at the larger of the penalty base and the backoff cap.
    pub fn penalty_delay(&mut self) -> Duration {
        let cap = self.cap.max(self.penalty_base);
        let delay = Self::exponential(self.penalty_base, self.penalty_count, cap);
        self.penalty_count = self.penalty_count.saturating_add(1);
        delay
    }

    /// Called after a successful connect: the next failure starts over at
    /// the base delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.penalty_count = 0;
    }

    /// Minimum spacing between any two connection attempts.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn exponential(base: Duration, attempt: u32, cap: Duration) -> Duration {
        // 2^attempt saturates well before Duration overflow territory.
        let factor = 1u32 << attempt.min(31);
        base.checked_mul(factor).map_or(cap, |d| d.min(cap))
    }
}
