//! Error types for the RTSP server library.

use std::fmt;

/// Errors that can occur in the RTSP server library.
///
/// Variants map to the failure taxonomy used across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP messages.
/// - **Auth**: [`Auth`](Self::Auth) — missing or invalid Digest credentials.
/// - **Lookup**: [`NotFound`](Self::NotFound), [`SessionNotFound`](Self::SessionNotFound).
/// - **Transport**: [`Io`](Self::Io), [`UnsupportedTransport`](Self::UnsupportedTransport),
///   [`TransportSend`](Self::TransportSend).
/// - **Resources**: [`ResourceExhausted`](Self::ResourceExhausted),
///   [`PortRangeExhausted`](Self::PortRangeExhausted).
/// - **Streaming**: [`SourceClosed`](Self::SourceClosed),
///   [`ProtocolViolation`](Self::ProtocolViolation).
/// - **Server lifecycle**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
///
/// Most of these are recoverable at the scope of a single connection or
/// session: see each variant's doc for propagation policy.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6). Translated to
    /// `400 Bad Request` on the offending connection only.
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Missing or invalid `Authorization` header against the configured
    /// realm/nonce. Translated to `401 Unauthorized` with a fresh challenge.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No stream (`ServerMediaSession`) registered under the requested name.
    /// Translated to `404 Not Found`.
    #[error("stream not found: {0}")]
    NotFound(String),

    /// `Transport:` header named a mode this server does not negotiate.
    /// Translated to `461 Unsupported Transport`.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// No session with the given ID exists. Translated to `454 Session Not
    /// Found`.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// SETUP has not been completed for this session (no ports negotiated).
    #[error("transport not configured for session: {0}")]
    TransportNotConfigured(String),

    /// Attempted to send media to a session that is not in the Playing
    /// state.
    #[error("session not in playing state: {0}")]
    SessionNotPlaying(String),

    /// A socket, port range, or session table slot could not be allocated.
    /// On accept this drops the new connection; elsewhere it closes the
    /// owning session.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Server-side RTP/RTCP port allocation exhausted the configured range.
    #[error("port range exhausted (tried to allocate beyond u16 range)")]
    PortRangeExhausted,

    /// A send over the RTP interface (UDP groupsock or an interleaved TCP
    /// stream) failed. Reported to the configured `on_send_error` callback;
    /// sequence numbers keep advancing regardless.
    #[error("failed to send RTP/RTCP data: {0}")]
    TransportSend(String),

    /// The upstream `FramedSource` reached end of stream. Not really an
    /// error: the RTP sink treats it as a signal to run its `afterPlaying`
    /// callback and tear the stream down.
    #[error("media source closed")]
    SourceClosed,

    /// An internal invariant was violated (e.g. fragmenter state machine
    /// desync). Fatal to the single affected stream only; logged and
    /// dropped.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already
    /// running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` named a body longer than was actually received.
    TruncatedBody,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::TruncatedBody => write!(f, "truncated request body"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
