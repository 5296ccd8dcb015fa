use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use http::HeaderMap;
/// HTTP status code type, re-exported for use with error inspection.
pub use http::StatusCode;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error establishing or using a connection
    Connect,
    /// Error related to invalid usage of the manager
    Validation,
    /// The manager was remotely expired and refuses further connections
    Expired,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    #[must_use]
    pub fn expired() -> Self {
        Self {
            kind: Kind::Expired,
            source: None,
            backtrace: Backtrace::capture(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

/// Sentinel status: the transport could not reach the server at all.
pub const UNREACHABLE_STATUS: u16 = 0;

/// Sentinel status: the attempt was aborted locally before completing.
pub const ABORTED_STATUS: u16 = 4499;

/// Failure of a single connection attempt, in HTTP vocabulary.
///
/// Cloneable so every holder of a [`crate::process::ConnectionProcess`] result
/// observes the same outcome. Callers inspect the status code to decide retry
/// eligibility.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectError {
    /// HTTP-style status code, or one of the sentinel values above
    pub status: u16,
    /// Response headers, if the server produced any
    pub headers: HeaderMap,
    pub message: String,
}

impl ConnectError {
    #[must_use]
    pub fn new<S: Into<String>>(status: u16, headers: HeaderMap, message: S) -> Self {
        Self {
            status,
            headers,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn status<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self::new(status.as_u16(), HeaderMap::new(), message)
    }

    #[must_use]
    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        Self::new(UNREACHABLE_STATUS, HeaderMap::new(), message)
    }

    #[must_use]
    pub fn aborted() -> Self {
        Self::new(
            ABORTED_STATUS,
            HeaderMap::new(),
            "connection attempt aborted",
        )
    }

    /// The server rejected the supplied credentials. Terminal until new
    /// credentials arrive.
    #[must_use]
    pub fn is_credential_rejection(&self) -> bool {
        matches!(self.status, 401 | 403)
    }

    /// Transient server or network failure, eligible for backoff retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        (500..=599).contains(&self.status) || self.status == UNREACHABLE_STATUS
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.status == ABORTED_STATUS
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connect failed ({}): {}", self.status, self.message)
    }
}

impl StdError for ConnectError {}

impl From<ConnectError> for Error {
    fn from(err: ConnectError) -> Self {
        Error::with_source(Kind::Connect, err)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}
