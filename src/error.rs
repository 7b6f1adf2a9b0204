//! `postgate` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    config::ParseError,
    postgres::{ProtocolError, ServerError},
    types::DecodeError,
};

/// A specialized [`Result`] type for `postgate` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Any error from the `postgate` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// The server error, when this is one.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match &self.kind {
            ErrorKind::Database(err) => Some(err),
            _ => None,
        }
    }

    pub(crate) fn invalid_op(reason: &'static str) -> Error {
        ErrorKind::InvalidOperation(reason).into()
    }

    /// Whether the connection this error came from is still usable.
    ///
    /// Server errors are fenced by Sync; framing and socket errors are not.
    pub(crate) fn is_fatal(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::Database(_)
                | ErrorKind::Decode(_)
                | ErrorKind::Config(_)
                | ErrorKind::InvalidOperation(_)
        )
    }
}

/// The kinds of error the core raises.
pub enum ErrorKind {
    /// Connection string or pool configuration rejected.
    Config(ParseError),
    /// Framing violation; fatal to the connection.
    Protocol(ProtocolError),
    /// Socket-level failure; fatal to the connection.
    Io(io::Error),
    /// Peer closed mid-message; fatal to the connection.
    UnexpectedEof,
    /// An ErrorResponse from the server; the connection stays usable
    /// after the containing Sync.
    Database(ServerError),
    /// A type handler could not convert a value.
    Decode(DecodeError),
    /// The server requested an authentication scheme this crate does not
    /// speak.
    UnsupportedAuth,
    /// A deadline elapsed.
    Timeout(TimeoutKind),
    /// The pool is at capacity and cannot wait.
    PoolExhausted,
    /// The pool was closed while waiting for a connector.
    PoolClosed,
    /// Caller misuse, e.g. output-direction parameters or reading past the
    /// end of the results.
    InvalidOperation(&'static str),
    /// Cooperative cancellation observed at a suspension point.
    Cancelled,
}

/// Which deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Waiting for a pooled connector.
    PoolAcquire,
    /// A single execute exceeded the command timeout.
    Command,
}

macro_rules! from {
    (<$ty:ty> $pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                Self {
                    context: String::new(),
                    backtrace: Backtrace::capture(),
                    kind: $body,
                }
            }
        }
    };
}

from!(<ErrorKind> e => e);
from!(<ParseError> e => ErrorKind::Config(e));
from!(<ProtocolError> e => ErrorKind::Protocol(e));
from!(<ServerError> e => ErrorKind::Database(e));
from!(<DecodeError> e => ErrorKind::Decode(e));
from!(<io::Error> e => match e.kind() {
    io::ErrorKind::UnexpectedEof => ErrorKind::UnexpectedEof,
    _ => ErrorKind::Io(e),
});

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::UnexpectedEof => f.write_str("connection closed mid-message"),
            Self::Database(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::UnsupportedAuth => f.write_str("authentication scheme not supported"),
            Self::Timeout(TimeoutKind::PoolAcquire) => {
                f.write_str("timed out waiting for a pooled connection")
            }
            Self::Timeout(TimeoutKind::Command) => f.write_str("command timed out"),
            Self::PoolExhausted => f.write_str("connection pool exhausted"),
            Self::PoolClosed => f.write_str("connection pool closed"),
            Self::InvalidOperation(reason) => write!(f, "invalid operation: {reason}"),
            Self::Cancelled => f.write_str("operation cancelled"),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
