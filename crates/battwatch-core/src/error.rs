// ── Core error types ──
//
// User-facing errors from battwatch-core. Consumers never see raw socket
// or JSON failures directly; the `From<battwatch_api::Error>` impl
// translates channel-layer errors into domain-appropriate variants.

use thiserror::Error;

/// Error type shared by every engine operation.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot reach the command service: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Command channel disconnected")]
    Disconnected,

    #[error("Command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Operation errors ─────────────────────────────────────────────
    /// The server rejected a command.
    #[error("Operation rejected: {message}")]
    Rejected {
        message: String,
        code: Option<String>,
    },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    // ── Data errors ──────────────────────────────────────────────────
    /// The server's reply did not match the expected shape. The page
    /// fetch that triggered it has been aborted and the list cleared.
    #[error("Malformed server response: {message}")]
    InvalidResponse { message: String },

    // ── Lifecycle / internal ─────────────────────────────────────────
    #[error("Engine is not attached")]
    NotAttached,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// `true` for failures that should feed the reconnect path instead of
    /// being surfaced to the user directly.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::Disconnected | Self::Timeout { .. }
        )
    }
}

// ── Conversion from channel-layer errors ─────────────────────────────

impl From<battwatch_api::Error> for CoreError {
    fn from(err: battwatch_api::Error) -> Self {
        match err {
            battwatch_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            battwatch_api::Error::Socket(reason) => CoreError::ConnectionFailed { reason },
            battwatch_api::Error::NotConnected => CoreError::Disconnected,
            battwatch_api::Error::Closed { code, reason } => CoreError::ConnectionFailed {
                reason: format!("connection closed (code {code}): {reason}"),
            },
            battwatch_api::Error::InvalidUrl(e) => CoreError::Validation {
                message: format!("invalid URL: {e}"),
            },
            battwatch_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            battwatch_api::Error::CallFailed { code, message } => CoreError::Rejected {
                message,
                code: Some(code),
            },
            battwatch_api::Error::Decode { message, body: _ } => {
                CoreError::InvalidResponse { message }
            }
        }
    }
}
