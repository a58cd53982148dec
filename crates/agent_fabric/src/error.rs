//! Fabric error types.

use std::time::Duration;

use crate::message::MessageId;

/// Errors that can occur in the agent_fabric crate.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// An envelope could not be encoded or decoded. The message is dropped.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The remote endpoint refused the transport connection.
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    /// An established transport connection went away.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The parent answered the registration handshake with a rejection.
    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    /// The parent never answered the registration handshake.
    #[error("Registration timed out after {0:?}")]
    RegistrationTimeout(Duration),

    /// Every connect attempt in the backoff budget failed.
    #[error("Registration failed after {attempts} attempts: {last_error}")]
    RegistrationFailed { attempts: u32, last_error: String },

    /// An envelope could not be built or enqueued.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// An acknowledged send exhausted its retry budget or was cancelled.
    #[error("Delivery of message {id} failed after {attempts} attempts: {reason}")]
    DeliveryFailed {
        id: MessageId,
        attempts: u32,
        reason: String,
    },

    /// The stream session was closed locally or by the node shutting down.
    #[error("Stream closed: {0}")]
    StreamClosed(String),

    /// The node has not been started.
    #[error("Node not running")]
    NotRunning,

    /// The node or connection has been closed.
    #[error("Closed")]
    Closed,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FabricError {
    /// Transport-level failures that the node retries locally with backoff.
    ///
    /// Everything else is a semantic failure handed back to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused(_) | Self::ConnectionLost(_) | Self::Timeout(_) | Self::Io(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FabricError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FabricError::ConnectionLost("peer".into()).is_transient());
        assert!(FabricError::ConnectionRefused("peer".into()).is_transient());
        assert!(FabricError::Timeout(Duration::from_millis(5)).is_transient());

        assert!(!FabricError::RegistrationRejected("dup".into()).is_transient());
        assert!(!FabricError::MalformedEnvelope("bad".into()).is_transient());
        assert!(
            !FabricError::DeliveryFailed {
                id: MessageId(3),
                attempts: 4,
                reason: "no ack".into(),
            }
            .is_transient()
        );
    }

    #[test]
    fn test_error_display() {
        let err = FabricError::RegistrationFailed {
            attempts: 5,
            last_error: "refused".into(),
        };
        assert_eq!(err.to_string(), "Registration failed after 5 attempts: refused");

        let err = FabricError::DeliveryFailed {
            id: MessageId(42),
            attempts: 3,
            reason: "ack timeout".into(),
        };
        assert_eq!(
            err.to_string(),
            "Delivery of message 42 failed after 3 attempts: ack timeout"
        );
    }
}
