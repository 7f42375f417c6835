//! Error types for redirect capture and the authorization flow.

use std::time::Duration;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Errors produced while decoding a captured redirect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The client closed the connection before sending anything.
    #[error("empty request")]
    Empty,

    /// The request line is not `METHOD TARGET VERSION`.
    #[error("malformed request line")]
    Malformed,

    /// Only `GET` is served on the capture endpoint.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// The request hit a path other than the callback path.
    #[error("unexpected path: {0}")]
    UnexpectedPath(String),

    /// A query component did not percent-decode to UTF-8.
    #[error("invalid percent-encoding in query")]
    InvalidEncoding,

    /// The redirect carried neither `code` nor `error`.
    #[error("redirect carried neither code nor error")]
    MissingCode,

    /// A relayed URI did not use the registered scheme.
    #[error("uri does not use scheme '{0}'")]
    InvalidScheme(String),
}

/// Errors from installing or checking the OS URI-scheme association.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// The OS refused the write.
    #[error("permission denied writing scheme association: {0}")]
    Permission(String),

    /// Filesystem error while reading or writing the association.
    #[error("scheme association I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A helper tool (`xdg-mime`, `reg`, `lsregister`) failed.
    #[error("'{program}' failed: {message}")]
    Command { program: String, message: String },

    /// The host platform cannot install the association at runtime.
    #[error("scheme registration unsupported: {0}")]
    Unsupported(String),
}

/// Errors from a capture backend.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// No candidate loopback port could be bound.
    #[error("failed to bind loopback listener: {0}")]
    Bind(String),

    /// Socket I/O failed after the listener was up.
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The single inbound request could not be used.
    #[error("malformed redirect: {0}")]
    Malformed(#[from] ParseError),

    /// The deadline elapsed before a redirect arrived.
    #[error("timed out waiting for redirect")]
    Timeout,

    /// The wait was cancelled by the caller.
    #[error("capture cancelled")]
    Cancelled,

    /// Single-instance or relay channel failure.
    #[error("instance relay error: {0}")]
    Ipc(String),

    /// The URI-scheme association could not be installed.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The OS secure random source is unavailable.
    #[error("secure random source unavailable: {0}")]
    Entropy(String),
}

/// Errors from misusing or starting the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// `begin` was called while a capture is already in flight.
    #[error("an authorization flow is already listening")]
    AlreadyListening,

    /// `result` was called without a flow in `Listening`.
    #[error("no authorization flow is listening")]
    NotListening,

    /// The requested wait is longer than any backend supports.
    #[error("timeout of {requested:?} exceeds the maximum of {max:?}")]
    DeadlineTooLong { requested: Duration, max: Duration },

    /// The backend could not be started.
    #[error(transparent)]
    Capture(#[from] CaptureError),
}
