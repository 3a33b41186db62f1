use thiserror::Error;

/// Errors produced by the stream engine.
///
/// Recoverable variants are answered on the stream (protocol-error stanza,
/// `<failure/>`, error iq) and leave the session open; fatal variants end the
/// session with an orderly close of that connection only.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed wire data. Fatal: the framing layer can no longer find
    /// stanza boundaries, so the connection is closed.
    #[error("malformed stream data: {0}")]
    FrameSyntax(String),

    /// The peer closed the byte channel. Ends the session normally.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Stanza is legal in some state, just not the current one. Recoverable;
    /// counts toward the per-session abuse threshold.
    #[error("stanza illegal in current state: {0}")]
    ProtocolOrder(String),

    /// Credentials rejected. Recoverable; the client may retry.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// No handler registered for a query kind. Recoverable; answered with an
    /// error iq carrying the query's id.
    #[error("no handler for query kind: {0}")]
    UnsupportedQuery(String),

    /// Handshake deadline or idle timeout expired. Fatal.
    #[error("negotiation timed out")]
    Timeout,

    /// Underlying channel failure. Fatal; not retried by the engine.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error must end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::FrameSyntax(_)
                | EngineError::ConnectionClosed
                | EngineError::Timeout
                | EngineError::Transport(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::FrameSyntax("x".into()).is_fatal());
        assert!(EngineError::Timeout.is_fatal());
        assert!(EngineError::ConnectionClosed.is_fatal());
        assert!(!EngineError::ProtocolOrder("x".into()).is_fatal());
        assert!(!EngineError::AuthFailed("x".into()).is_fatal());
        assert!(!EngineError::UnsupportedQuery("x".into()).is_fatal());
    }

    #[test]
    fn test_io_error_converts_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Transport(_)));
        assert!(err.is_fatal());
    }
}
