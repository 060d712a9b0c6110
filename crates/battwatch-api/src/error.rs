use thiserror::Error;

/// Top-level error type for the `battwatch-api` crate.
///
/// Covers every failure mode of the command channel: the auth handshake,
/// the socket itself, individual command calls, and payload decoding.
/// `battwatch-core` maps these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The server rejected the access token during the handshake.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Socket ──────────────────────────────────────────────────────
    /// The websocket could not be established or dropped mid-read.
    #[error("Socket error: {0}")]
    Socket(String),

    /// A command was issued while the socket is down.
    #[error("Command channel is not connected")]
    NotConnected,

    /// The server sent a close frame.
    #[error("Connection closed (code {code}): {reason}")]
    Closed { code: u16, reason: String },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Commands ────────────────────────────────────────────────────
    /// A command call did not complete within its timeout window.
    #[error("Command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The server answered the call with `success: false`.
    #[error("Command rejected ({code}): {message}")]
    CallFailed { code: String, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// A reply or push payload did not match its declared shape.
    /// Carries the raw body for debugging.
    #[error("Decode error: {message}")]
    Decode { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient failure worth feeding into
    /// the reconnect path rather than surfacing to the user.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Socket(_) | Self::NotConnected | Self::Closed { .. } | Self::Timeout { .. }
        )
    }

    /// Build a decode error from a serde failure plus the offending body.
    pub(crate) fn decode(err: &serde_json::Error, body: impl Into<String>) -> Self {
        Self::Decode {
            message: err.to_string(),
            body: body.into(),
        }
    }
}
