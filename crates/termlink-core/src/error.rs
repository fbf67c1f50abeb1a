//! Error taxonomy for the wire protocol and session plumbing.

use thiserror::Error;

/// Frame codec and transport failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stream ended before a complete header or payload arrived.
    ///
    /// Distinct from [`ProtocolError::Io`] so callers can tell "peer hung
    /// up mid-frame" from "socket broke".
    #[error("truncated frame: stream closed mid-frame")]
    Truncated,

    /// The declared payload length exceeds the caller's cap.
    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures during the first-frame handshake.
///
/// Every variant is surfaced to the peer as an `Error` frame before the
/// connection closes; see [`HandshakeError::wire_message`].
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// No complete handshake frame arrived within the deadline.
    #[error("handshake timeout")]
    Timeout,

    /// The first frame was not a `Handshake` frame.
    #[error("expected handshake frame")]
    UnexpectedFrame,

    /// The handshake payload was not a valid JSON object.
    #[error("invalid handshake json: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    /// The configured secret token did not match.
    #[error("unauthorized")]
    Unauthorized,

    /// The peer hung up or the socket broke before the handshake completed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HandshakeError {
    /// Error text sent to the peer in the final `Error` frame.
    ///
    /// A read failure during the handshake is reported as a timeout: from
    /// the peer's point of view the handshake simply never completed.
    pub fn wire_message(&self) -> &'static str {
        match self {
            Self::Timeout | Self::Protocol(_) => "handshake timeout",
            Self::UnexpectedFrame => "expected handshake frame",
            Self::InvalidPayload(_) => "invalid handshake json",
            Self::Unauthorized => "unauthorized",
        }
    }
}

/// PTY session failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open pty: {0}")]
    OpenPty(String),

    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("pty write failed: {0}")]
    Write(String),

    #[error("failed to resize pty: {0}")]
    Resize(String),

    #[error("session already closed")]
    Closed,
}

/// Client-side terminal control failures.
///
/// Fatal to the client process, but the original terminal mode is always
/// restored before exiting.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("stdin is not a terminal")]
    NotATty,

    #[error("failed to read terminal attributes: {0}")]
    GetAttr(#[source] std::io::Error),

    #[error("failed to set terminal attributes: {0}")]
    SetAttr(#[source] std::io::Error),
}
