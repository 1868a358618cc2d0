use std::fmt;

/// Error kinds produced across the proxy. Mirrors the four kinds the design
/// distinguishes: a caller contract violation, a policy rejection, a
/// transient I/O hiccup, and an unrecoverable record-before-forward failure.
#[derive(Debug)]
pub enum Error {
    /// Caller violated a contract: bad state transition, malformed input,
    /// empty CA, bad content-length, non-empty repo directory, etc.
    Invalid(String),
    /// Policy rejection by a handler. Surfaced to the HTTP client as 403.
    Denied(String),
    /// Read/write on a closed peer socket, or similar recoverable I/O.
    Transient(String),
    /// The record-before-forward invariant could not be honored.
    Fatal(String),
    /// Wrapped I/O error that doesn't fit one of the kinds above.
    Io(std::io::Error),
    /// Anything else, boxed.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Invalid(msg) => write!(f, "invalid: {msg}"),
            Error::Denied(msg) => write!(f, "denied: {msg}"),
            Error::Transient(msg) => write!(f, "transient: {msg}"),
            Error::Fatal(msg) => write!(f, "fatal: {msg}"),
            Error::Io(err) => write!(f, "io: {err}"),
            Error::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Error::Invalid(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
