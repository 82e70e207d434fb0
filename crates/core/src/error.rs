//! Error types for the relay library.

use std::fmt;

use crate::protocol::response::StatusCode;
use crate::session::SessionState;

/// Errors raised by the codec, transport and server layers.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Codec**: [`Parse`](Self::Parse), [`UnsupportedVersion`](Self::UnsupportedVersion),
///   [`Truncated`](Self::Truncated).
/// - **Framing**: [`BadMagic`](Self::BadMagic), [`FrameTooLarge`](Self::FrameTooLarge).
/// - **Transport**: [`Io`](Self::Io).
/// - **Channel**: [`ChannelClosed`](Self::ChannelClosed).
/// - **Server**: [`NotStarted`](Self::NotStarted), [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Request line carried a protocol version other than `RTSP/1.0`.
    #[error("unsupported RTSP version: {0}")]
    UnsupportedVersion(String),

    /// The peer closed the stream in the middle of a message or frame.
    #[error("truncated message")]
    Truncated,

    /// An interleaved frame did not start with `$`.
    #[error("bad interleaved magic byte: {0:#04x}")]
    BadMagic(u8),

    /// An interleaved frame declared a payload above the packet size limit.
    #[error("interleaved frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// The channel's fan-out loop is gone.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

impl RelayError {
    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        Self::Parse { kind }
    }

    /// Maps an unexpected EOF to [`Truncated`](Self::Truncated).
    pub(crate) fn from_read(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(e)
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a decimal integer.
    InvalidContentLength,
    /// A single line exceeded the line length limit.
    LineTooLong,
    /// The header block exceeded the header count limit.
    TooManyHeaders,
    /// `Content-Length` exceeded the body size limit.
    BodyTooLarge,
    /// The request line or a header was not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::LineTooLong => write!(f, "line too long"),
            Self::TooManyHeaders => write!(f, "too many headers"),
            Self::BodyTooLarge => write!(f, "body too large"),
            Self::InvalidUtf8 => write!(f, "invalid utf-8"),
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Failure of a single RTSP method handler.
///
/// Every variant becomes a peer-visible response; none of them terminate
/// the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MethodError {
    /// Missing or malformed request content.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown channel or media control id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Method is not in the dispatch table.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// `Session` header does not name this connection's session.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Method is illegal in the session's current state.
    #[error("{method} not valid in state {state}")]
    InvalidState { method: String, state: SessionState },

    /// Missing, invalid or unsupported `Transport` header.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Missing description or producer-lock contention.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MethodError {
    /// Status code reported to the peer.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BadRequest,
            Self::NotFound(_) => StatusCode::NotFound,
            Self::MethodNotAllowed(_) => StatusCode::MethodNotAllowed,
            Self::SessionNotFound(_) => StatusCode::SessionNotFound,
            Self::InvalidState { .. } => StatusCode::MethodNotValidInThisState,
            Self::UnsupportedTransport(_) => StatusCode::UnsupportedTransport,
            Self::Internal(_) => StatusCode::InternalServerError,
        }
    }
}
