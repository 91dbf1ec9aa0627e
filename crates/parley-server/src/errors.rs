use std::time::Duration;

/// Failures of a session's transport. Always fatal to that session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error("connection closed by peer")]
    Closed,
}

/// The session was torn down; nothing can be queued on it anymore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("session closed")]
pub struct SessionClosed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_limits() {
        let err = TransportError::FrameTooLarge { size: 300, limit: 256 };
        assert_eq!(err.to_string(), "frame of 300 bytes exceeds the 256 byte limit");
        let err = TransportError::WriteTimeout(Duration::from_secs(10));
        assert!(err.to_string().contains("10s"));
    }
}
