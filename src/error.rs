//! Error type for calls.
//!
//! Failures carry a kind (the taxonomy the retry and cache stages dispatch
//! on), an optional underlying source, and any suppressed secondary errors
//! picked up while the primary one propagated out of the interceptor stack.

use std::fmt;

use thiserror::Error;

use crate::BoxError;

/// The category of a call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The call was canceled, either by the user or by its timeout.
    #[error("call canceled")]
    Canceled,

    /// The call-level timeout fired before the call completed.
    #[error("call timed out")]
    Timeout,

    /// DNS resolution failed or produced no usable addresses.
    #[error("dns")]
    Dns,

    /// A socket, TLS, or stream I/O failure during the exchange.
    #[error("transport")]
    Transport,

    /// The peer violated the protocol (e.g. a 204 advertising a body).
    /// Fatal for the connection that produced it.
    #[error("protocol violation")]
    Protocol,

    /// The connection was shut down before the request was transmitted.
    /// Safe to retry transparently on another connection.
    #[error("connection shutdown before request was sent")]
    ConnectionShutdown,

    /// A programmer-facing misuse of the API, such as executing a call
    /// twice or proceeding past a closed chain.
    #[error("contract violation")]
    Contract,
}

/// Error produced while executing a call.
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<BoxError>,
    suppressed: Vec<Error>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            suppressed: Vec::new(),
        }
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub(crate) fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub(crate) fn canceled() -> Self {
        Self::new(ErrorKind::Canceled)
    }

    /// Wrap an error that escaped the chain while the call timeout had
    /// already fired, preserving the original as the cause.
    pub(crate) fn timeout(cause: Error) -> Self {
        Self::new(ErrorKind::Timeout).with_source(cause)
    }

    pub(crate) fn transport(source: impl Into<BoxError>) -> Self {
        Self::new(ErrorKind::Transport).with_source(source)
    }

    pub(crate) fn dns(source: impl Into<BoxError>) -> Self {
        Self::new(ErrorKind::Dns).with_source(source)
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol).with_message(message)
    }

    pub(crate) fn shutdown() -> Self {
        Self::new(ErrorKind::ConnectionShutdown)
    }

    pub(crate) fn contract(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Contract).with_message(message)
    }

    /// Attach a secondary failure that was consumed while this error
    /// propagated.
    pub(crate) fn with_suppressed(mut self, suppressed: Error) -> Self {
        self.suppressed.push(suppressed);
        self
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Secondary failures attached to this error.
    pub fn suppressed(&self) -> &[Error] {
        &self.suppressed
    }

    /// Whether this error was produced by `cancel` or a timeout.
    pub fn is_canceled(&self) -> bool {
        matches!(self.kind, ErrorKind::Canceled | ErrorKind::Timeout)
    }

    /// Whether the retry stage may transparently retry after this error,
    /// as far as the error itself is concerned. Route availability and
    /// request replayability are judged separately.
    pub(crate) fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Transport | ErrorKind::ConnectionShutdown | ErrorKind::Dns
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.kind, message),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Error");
        s.field("kind", &self.kind);
        if let Some(message) = &self.message {
            s.field("message", message);
        }
        if let Some(source) = &self.source {
            s.field("source", source);
        }
        if !self.suppressed.is_empty() {
            s.field("suppressed", &self.suppressed);
        }
        s.finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|s| s as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::transport(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: std::error::Error, Send, Sync);

    #[test]
    fn display_includes_message() {
        let error = Error::protocol("204 with a body");
        assert_eq!(error.to_string(), "protocol violation: 204 with a body");
        assert_eq!(error.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn timeout_preserves_cause() {
        let cause = Error::canceled();
        let error = Error::timeout(cause);
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert!(error.is_canceled());
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn suppressed_errors_are_attached() {
        let error = Error::transport(std::io::Error::other("send failed"))
            .with_suppressed(Error::shutdown());
        assert_eq!(error.suppressed().len(), 1);
        assert_eq!(
            error.suppressed()[0].kind(),
            ErrorKind::ConnectionShutdown
        );
    }

    #[test]
    fn recoverable_kinds() {
        assert!(Error::shutdown().is_recoverable());
        assert!(Error::transport(std::io::Error::other("x")).is_recoverable());
        assert!(!Error::protocol("x").is_recoverable());
        assert!(!Error::canceled().is_recoverable());
    }
}
