use std::fmt;

use crate::caps::Capabilities;
use crate::endpoint::EndpointState;
use crate::fid::FidKind;
use crate::queue::{CqErrEntry, EqErrEntry};

/// Provider status codes.
///
/// Codes follow the errno numbering fabric APIs use; calls report them
/// negated (see [`Errno::status`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Resource temporarily unavailable; drain a completion and retry.
    Again,
    /// An error record is waiting to be read from the queue.
    Avail,
    /// No provider matches the requested attributes.
    NoData,
    ConnRefused,
    ConnReset,
    NotConn,
    /// Object still has dependents open.
    Busy,
    /// Message longer than the receive buffer it matched.
    Truncated,
    TimedOut,
    InvalidArg,
    /// Operation not valid in the endpoint's current state.
    OpNotSupported,
    /// Operation cancelled by endpoint shutdown.
    Canceled,
    AddrInUse,
    /// Peer violated the provider wire protocol.
    Proto,
    Io,
}

impl Errno {
    /// Positive error number.
    pub fn code(self) -> i32 {
        match self {
            Errno::Again => 11,
            Errno::Avail => 259,
            Errno::NoData => 61,
            Errno::ConnRefused => 111,
            Errno::ConnReset => 104,
            Errno::NotConn => 107,
            Errno::Busy => 16,
            Errno::Truncated => 265,
            Errno::TimedOut => 110,
            Errno::InvalidArg => 22,
            Errno::OpNotSupported => 95,
            Errno::Canceled => 125,
            Errno::AddrInUse => 98,
            Errno::Proto => 71,
            Errno::Io => 5,
        }
    }

    /// Status as returned by a failing call (negative).
    pub fn status(self) -> i32 {
        -self.code()
    }

    /// Textual description of the error.
    pub fn strerror(self) -> &'static str {
        match self {
            Errno::Again => "Resource temporarily unavailable",
            Errno::Avail => "Error available",
            Errno::NoData => "No data available",
            Errno::ConnRefused => "Connection refused",
            Errno::ConnReset => "Connection reset by peer",
            Errno::NotConn => "Transport endpoint is not connected",
            Errno::Busy => "Device or resource busy",
            Errno::Truncated => "Truncation error",
            Errno::TimedOut => "Connection timed out",
            Errno::InvalidArg => "Invalid argument",
            Errno::OpNotSupported => "Operation not supported",
            Errno::Canceled => "Operation canceled",
            Errno::AddrInUse => "Address already in use",
            Errno::Proto => "Protocol error",
            Errno::Io => "Input/output error",
        }
    }

    /// Map an I/O error onto the closest provider code.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => Errno::ConnRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Errno::ConnReset
            }
            ErrorKind::NotConnected => Errno::NotConn,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Errno::TimedOut,
            ErrorKind::AddrInUse => Errno::AddrInUse,
            ErrorKind::InvalidInput => Errno::InvalidArg,
            _ => Errno::Io,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.strerror())
    }
}

/// Errors that can occur in fabric operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No provider matches the requested capabilities.
    #[error("no provider matches requested capabilities {requested:?}")]
    ResourceUnavailable {
        requested: Capabilities,
        available: Option<Capabilities>,
    },

    /// Unexpected failure of a setup or data-path call.
    #[error("{op}: {errno}")]
    Fatal { op: &'static str, errno: Errno },

    /// The event queue reported an error record.
    #[error("event queue error: {}, data size: {}", .0.err, .0.err_data.len())]
    EventQueue(EqErrEntry),

    /// A queue read found an error record; read it with `readerr`.
    #[error("{op}: {}", Errno::Avail)]
    ErrorAvailable { op: &'static str },

    /// The provider cannot take more work right now.
    #[error("{op}: {}", Errno::Again)]
    Again { op: &'static str },

    /// A posted operation completed in error.
    #[error("completion error: {}", .0.err)]
    Completion(CqErrEntry),

    /// An object was closed while objects depending on it were still open.
    #[error("cannot close {object}: {open} dependent object(s) still open")]
    TeardownOrderViolation { object: FidKind, open: usize },

    /// The object has already been closed.
    #[error("{op}: {object} is closed")]
    Closed { op: &'static str, object: FidKind },

    /// The endpoint is not in a state that allows the operation.
    #[error("{op}: endpoint is {state}, requires {required}")]
    InvalidState {
        op: &'static str,
        state: EndpointState,
        required: &'static str,
    },

    /// Socket-level failure.
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        source: std::io::Error,
    },

    /// Provider wire protocol failure.
    #[error("wire error: {0}")]
    Wire(#[from] fabex_wire::FrameError),
}

impl TransportError {
    pub(crate) fn io(op: &'static str, source: std::io::Error) -> Self {
        TransportError::Io { op, source }
    }

    /// Provider status code for this error.
    pub fn errno(&self) -> Errno {
        match self {
            TransportError::ResourceUnavailable { .. } => Errno::NoData,
            TransportError::Fatal { errno, .. } => *errno,
            TransportError::EventQueue(entry) => entry.err,
            TransportError::ErrorAvailable { .. } => Errno::Avail,
            TransportError::Again { .. } => Errno::Again,
            TransportError::Completion(entry) => entry.err,
            TransportError::TeardownOrderViolation { .. } => Errno::Busy,
            TransportError::Closed { .. } => Errno::InvalidArg,
            TransportError::InvalidState { .. } => Errno::OpNotSupported,
            TransportError::Io { source, .. } => Errno::from_io(source),
            TransportError::Wire(fabex_wire::FrameError::Io(source)) => Errno::from_io(source),
            TransportError::Wire(fabex_wire::FrameError::ConnectionClosed) => Errno::ConnReset,
            TransportError::Wire(_) => Errno::Proto,
        }
    }

    /// True for the transient-busy condition callers resolve by draining.
    pub fn is_again(&self) -> bool {
        matches!(self, TransportError::Again { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
