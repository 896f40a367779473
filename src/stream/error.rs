// =============================================================================
// Stream error taxonomy
// =============================================================================
//
// Failure classes matter here: a peer-signaled throttle (HTTP 418/429 on the
// upgrade, or a policy-violation close code) must take a longer penalty delay
// than an ordinary network error, so the two are distinct variants rather
// than one opaque error string.
// =============================================================================

/// Errors surfaced by the streaming client's connection layer.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// TCP/TLS/upgrade failure while establishing the connection.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The connect attempt did not complete within the configured timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The peer rejected or closed the connection for rate-limit reasons
    /// (HTTP 418/429 on the handshake, or close code 1008).
    #[error("rate limited by peer: {0}")]
    RateLimited(String),

    /// An operation that requires a live socket was called while disconnected.
    #[error("not connected")]
    NotConnected,

    /// The transport-level write failed; the connection is considered lost.
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl StreamError {
    /// True for the peer-throttle failure class that warrants a penalty delay
    /// instead of the ordinary backoff cadence.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_classification() {
        assert!(StreamError::RateLimited("418".into()).is_rate_limited());
        assert!(!StreamError::ConnectTimeout.is_rate_limited());
        assert!(!StreamError::NotConnected.is_rate_limited());
    }

    #[test]
    fn error_display() {
        assert_eq!(StreamError::NotConnected.to_string(), "not connected");
        assert_eq!(
            StreamError::SendFailed("broken pipe".into()).to_string(),
            "send failed: broken pipe"
        );
    }
}
