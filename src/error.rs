//! Error types for the bridge and its protocol layers.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the bridge and its protocol layers
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Transport(#[from] btleplug::Error),

    /// A binary decode ran off the end of the payload
    #[error("short buffer: needed {needed} bytes, got {got}")]
    ShortBuffer {
        /// Bytes required by the decode
        needed: usize,
        /// Bytes actually available
        got: usize,
    },

    /// A field held a value the protocol does not allow
    #[error("bad encoding: {0}")]
    BadEncoding(String),

    /// Command issued before the session reached `Ready`
    #[error("session not ready")]
    NotReady,

    /// The request requires a device that has no ready session
    #[error("device not connected")]
    NotConnected,

    /// Addressed entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request body or missing parameter
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A connection budget or discovery deadline elapsed
    #[error("timed out after {budget_ms}ms")]
    Timeout {
        /// The elapsed budget in milliseconds
        budget_ms: u64,
    },

    /// A pending operation was resolved by session teardown
    #[error("operation cancelled")]
    Cancelled,

    /// The peripheral does not expose a required service
    #[error("required service {0} missing")]
    ServiceMissing(Uuid),

    /// A listener socket could not bind its port
    #[error("failed to bind port {port}: {source}")]
    BindFailed {
        /// Port the listener tried to claim
        port: u16,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Check if this error should leave the session alive
    ///
    /// Parse errors on notifications are logged and dropped; they must
    /// never tear down the session that produced them.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ShortBuffer { .. }
                | Self::BadEncoding(_)
                | Self::NotReady
                | Self::BadRequest(_)
        )
    }

    /// Check if this error indicates the BLE link is gone
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout { .. } | Self::ServiceMissing(_)
        )
    }

    /// HTTP status code this error maps to on the REST surface
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::NotConnected | Self::NotReady => 503,
            Self::NotFound(_) => 404,
            Self::BadRequest(_) | Self::BadEncoding(_) | Self::ShortBuffer { .. } => 400,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let short = BridgeError::ShortBuffer { needed: 4, got: 2 };
        assert!(short.is_recoverable());
        assert!(!short.is_connection_error());

        let timeout = BridgeError::Timeout { budget_ms: 15_000 };
        assert!(!timeout.is_recoverable());
        assert!(timeout.is_connection_error());

        let missing = BridgeError::ServiceMissing(Uuid::nil());
        assert!(missing.is_connection_error());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(BridgeError::NotConnected.http_status(), 503);
        assert_eq!(BridgeError::NotReady.http_status(), 503);
        assert_eq!(BridgeError::NotFound("scale".into()).http_status(), 404);
        assert_eq!(
            BridgeError::BadRequest("deviceId required".into()).http_status(),
            400
        );
        assert_eq!(BridgeError::Cancelled.http_status(), 500);
    }

    #[test]
    fn test_error_display() {
        let error = BridgeError::ShortBuffer { needed: 9, got: 3 };
        let text = format!("{error}");
        assert!(text.contains("needed 9"));
        assert!(text.contains("got 3"));
    }
}
