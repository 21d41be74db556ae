//! Error taxonomy shared by the broker and the client.
//!
//! Every variant here corresponds to one of the `ERROR` frame codes in the
//! wire protocol (see [`crate::protocol`]). `ccr-server` maps a `CcrError`
//! to an `ERROR` frame at the socket boundary via [`CcrError::wire_code`];
//! internal `Display` text only ever reaches the wire through the
//! documented `message` field, never raw `io::Error`/JSON debug output.

use thiserror::Error;

/// Errors raised by `ccr-core` operations.
#[derive(Debug, Error)]
pub enum CcrError {
    /// No `AUTH` frame arrived within the 5s handshake window.
    #[error("authentication timed out")]
    AuthTimeout,

    /// The bearer token failed signature verification or has expired.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The socket attempted a message before completing the AUTH handshake.
    #[error("authentication required")]
    AuthRequired,

    /// An operation that requires an attached session was issued without one.
    #[error("no session attached")]
    NoSession,

    /// A `SESSION_CONTROL` frame was missing a required `sessionId`.
    #[error("missing sessionId")]
    MissingSessionId,

    /// The referenced session id does not exist in the registry.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A sandboxed file operation failed (I/O, size cap, traversal).
    #[error("file error: {0}")]
    FileError(String),

    /// The client exceeded its request budget for the current window.
    #[error("rate limited")]
    RateLimited,

    /// A wire frame could not be decoded.
    #[error("parse error: {0}")]
    ParseError(String),
}

impl CcrError {
    /// The wire `ERROR` frame code for this error.
    #[must_use]
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::AuthTimeout => "AUTH_TIMEOUT",
            Self::AuthFailed(_) => "AUTH_FAILED",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::NoSession => "NO_SESSION",
            Self::MissingSessionId => "MISSING_SESSION_ID",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::FileError(_) => "FILE_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::ParseError(_) => "PARSE_ERROR",
        }
    }

    /// True if the socket should be closed after this error is reported.
    /// Only auth failures close the socket; everything else is reported
    /// and the connection stays open.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthTimeout | Self::AuthFailed(_) | Self::AuthRequired)
    }
}

/// Convenience alias used throughout `ccr-core`.
pub type Result<T> = std::result::Result<T, CcrError>;
