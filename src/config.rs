//! Engine configuration.
//!
//! Built once by the surrounding process before the supervisor starts
//! accepting, then shared read-only with every connection. Listener address,
//! TLS, and the authenticator backend are wired externally; this struct only
//! carries what the negotiation state machine itself needs.

use std::time::Duration;

/// Bounded time from connection accept until resource binding completes.
///
/// A client that connects and never finishes the handshake would otherwise
/// hold a task and a socket forever. 30 seconds covers slow links and an
/// interactive auth prompt on the client side.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Inactivity timeout once a session is established.
///
/// 5 minutes is generous: XMPP clients ping well inside that window, so a
/// silent established session is dead, not quiet.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Consecutive out-of-order stanzas tolerated before the session is closed.
pub const DEFAULT_ORDER_VIOLATION_LIMIT: u32 = 3;

/// Maximum allowed size for a connection's frame extraction buffer.
///
/// If the buffer exceeds this limit without yielding a complete stanza, the
/// connection is closed. Typical stanzas are a few KB; 1 MB leaves room for
/// the largest legitimate payloads while bounding memory per connection.
pub const MAX_FRAME_BUFFER_SIZE: usize = 1_024 * 1_024;

/// Process-wide engine configuration, including the advertised mechanism set.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Domain this server answers for; the domainpart of every bound address.
    pub domain: String,
    /// Ordered set of authentication mechanisms advertised per stream epoch.
    /// Immutable for the supervisor's lifetime.
    pub mechanisms: Vec<String>,
    /// Deadline from accept to `Bound`.
    pub handshake_timeout: Duration,
    /// Inactivity limit once `Established`.
    pub idle_timeout: Duration,
    /// Consecutive protocol-order violations before the session is closed.
    pub order_violation_limit: u32,
    /// Cap on the per-connection frame buffer.
    pub max_frame_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            mechanisms: vec!["PLAIN".to_string()],
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            order_violation_limit: DEFAULT_ORDER_VIOLATION_LIMIT,
            max_frame_buffer: MAX_FRAME_BUFFER_SIZE,
        }
    }
}

impl EngineConfig {
    /// Whether `mechanism` is in the advertised set.
    pub fn supports_mechanism(&self, mechanism: &str) -> bool {
        self.mechanisms.iter().any(|m| m == mechanism)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_advertises_plain() {
        let config = EngineConfig::default();
        assert!(config.supports_mechanism("PLAIN"));
        assert!(!config.supports_mechanism("SCRAM-SHA-1"));
        assert_eq!(config.order_violation_limit, 3);
    }
}
