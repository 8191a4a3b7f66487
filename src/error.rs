use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced anywhere in the connection lifecycle.
///
/// The variants line up with the taxonomy in the error-handling design:
/// transport, protocol, authentication and decoder failures are all
/// fatal to the connection that raised them (the receive/send workers
/// stop and the engine decides whether to reconnect); [`Error::Cancelled`]
/// is not really an error and unwinds silently.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying transport failed (connect refused, reset, TLS
    /// handshake failure, ...). Reconnection may be attempted.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer closed the connection in the middle of a read.
    #[error("disconnected")]
    Disconnected,

    /// A field in the wire stream had a value this implementation does
    /// not understand and cannot safely skip over.
    #[error("unexpected value for {0}: {1}")]
    UnexpectedValue(&'static str, String),

    /// The server sent a version string this implementation does not
    /// recognize.
    #[error("unsupported protocol version")]
    UnsupportedVersion,

    /// The server's initial security-type list was empty, or didn't
    /// contain any type this client (and the caller's authentication
    /// handler) is willing to use.
    #[error("no acceptable security type: {0}")]
    NoAcceptableSecurityType(String),

    /// Security-result word (or an inline VeNCrypt/RA2 failure word)
    /// came back nonzero.
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    /// The authentication handler could not supply credentials (user
    /// cancelled a prompt, no handler registered for the given type).
    #[error("authentication unavailable")]
    AuthenticationUnavailable,

    /// The server's reported hash of the RSA keys did not match what
    /// this client computed — a sign of a man-in-the-middle.
    #[error("RSA key hash mismatch (possible MITM)")]
    KeyMismatch,

    /// AES-EAX MAC verification failed on a received frame.
    #[error("AEAD authentication failed (possible MITM)")]
    AuthenticationTagMismatch,

    /// A pixel format, rectangle or sub-encoding payload violated an
    /// invariant this implementation cannot auto-correct.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A rectangle decoder encountered data it cannot represent (e.g.
    /// palette index out of range, gradient filter on an unsupported
    /// bits-per-pixel).
    #[error("decoder error in {encoding}: {message}")]
    Decoder {
        encoding: &'static str,
        message: String,
    },

    /// The server reported an explicit failure string, either via the
    /// security-result path or embedded in a ServerInit that looks like
    /// an error message rather than a real desktop name.
    #[error("server reported an error: {0}")]
    Server(String),

    /// A blocking operation observed its cancellation token before it
    /// could complete. Not a real failure — callers should treat this as
    /// "stop, don't report".
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn unexpected(field: &'static str, got: impl std::fmt::Display) -> Error {
        Error::UnexpectedValue(field, got.to_string())
    }

    pub(crate) fn decoder(encoding: &'static str, message: impl Into<String>) -> Error {
        Error::Decoder {
            encoding,
            message: message.into(),
        }
    }

    /// True for errors that should trigger reconnection rather than a
    /// terminal close (transport hiccups, unexpected EOF). Protocol,
    /// authentication and decoder errors are not retried automatically
    /// since retrying would just repeat the same failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Disconnected)
    }
}
