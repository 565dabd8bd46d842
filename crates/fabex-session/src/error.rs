use std::time::Duration;

use fabex_transport::{Errno, TransportError};

use crate::exchange::Direction;

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// A transfer failed before any of its bytes were posted.
    #[error("{direction} failed before any data was posted: {source}")]
    TransferFailed {
        direction: Direction,
        #[source]
        source: TransportError,
    },

    /// A chunked transfer failed after part of the buffer was posted. The
    /// receiving side never returns the partial data.
    #[error("{direction} aborted after posting {posted} of {total} bytes: {source}")]
    PartialTransferAborted {
        direction: Direction,
        posted: usize,
        total: usize,
        #[source]
        source: TransportError,
    },

    /// The listening side never saw the connection confirmed.
    #[error("connection not confirmed after {attempts} wait(s) of {timeout:?}")]
    ConfirmTimeout { attempts: u32, timeout: Duration },

    /// No connection request arrived in time.
    #[error("no connection request within {0:?}")]
    RequestTimeout(Duration),

    /// The peer or the provider broke the exchange protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        SessionError::Protocol(reason.into())
    }

    /// Provider status behind this error, if it came from the transport.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            SessionError::Transport(err)
            | SessionError::TransferFailed { source: err, .. }
            | SessionError::PartialTransferAborted { source: err, .. } => Some(err.errno()),
            SessionError::ConfirmTimeout { .. } | SessionError::RequestTimeout(_) => {
                Some(Errno::TimedOut)
            }
            SessionError::Protocol(_) => None,
        }
    }

    /// Name of the failing transport operation, when there is one.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            SessionError::Transport(TransportError::Fatal { op, .. })
            | SessionError::Transport(TransportError::Again { op })
            | SessionError::Transport(TransportError::ErrorAvailable { op })
            | SessionError::Transport(TransportError::Io { op, .. })
            | SessionError::Transport(TransportError::Closed { op, .. })
            | SessionError::Transport(TransportError::InvalidState { op, .. }) => Some(*op),
            SessionError::Transport(TransportError::ResourceUnavailable { .. }) => Some("getinfo"),
            SessionError::Transport(TransportError::EventQueue(_)) => Some("eq_sread"),
            SessionError::TransferFailed { direction, .. }
            | SessionError::PartialTransferAborted { direction, .. } => Some(direction.op()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SessionError::ConfirmTimeout { .. } | SessionError::RequestTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
