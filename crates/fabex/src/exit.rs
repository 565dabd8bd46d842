use std::fmt;

use fabex_session::SessionError;
use fabex_transport::TransportError;

// Exit codes follow sysexits where one fits.
pub const SUCCESS: i32 = 0;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const RESOURCE_UNAVAILABLE: i32 = 69;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Map a session failure to an exit code and an
/// `<operation>: <description>` message.
pub fn session_error(err: SessionError) -> CliError {
    let code = match &err {
        SessionError::Transport(TransportError::ResourceUnavailable { .. }) => {
            RESOURCE_UNAVAILABLE
        }
        SessionError::Transport(TransportError::TeardownOrderViolation { .. }) => INTERNAL,
        SessionError::Transport(_)
        | SessionError::TransferFailed { .. }
        | SessionError::PartialTransferAborted { .. } => TRANSPORT_ERROR,
        SessionError::ConfirmTimeout { .. } | SessionError::RequestTimeout(_) => TIMEOUT,
        SessionError::Protocol(_) => DATA_INVALID,
    };
    let description = err.to_string();
    let message = match err.operation() {
        Some(op) if !description.starts_with(op) => format!("{op}: {description}"),
        _ => description,
    };
    CliError::new(code, message)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fabex_transport::{Capabilities, Errno};

    use super::*;

    #[test]
    fn fatal_transport_errors_name_the_operation() {
        let err = session_error(SessionError::Transport(TransportError::Fatal {
            op: "connect",
            errno: Errno::ConnRefused,
        }));
        assert_eq!(err.code, TRANSPORT_ERROR);
        assert_eq!(err.message, "connect: Connection refused");
    }

    #[test]
    fn unsupported_capabilities_are_resource_unavailable() {
        let err = session_error(SessionError::Transport(
            TransportError::ResourceUnavailable {
                requested: Capabilities::RMA,
                available: Some(Capabilities::MSG),
            },
        ));
        assert_eq!(err.code, RESOURCE_UNAVAILABLE);
        assert!(err.message.starts_with("getinfo: "));
    }

    #[test]
    fn timeouts_and_protocol_errors() {
        let timeout = session_error(SessionError::RequestTimeout(Duration::from_secs(1)));
        assert_eq!(timeout.code, TIMEOUT);
        let protocol = session_error(SessionError::Protocol("bad count".into()));
        assert_eq!(protocol.code, DATA_INVALID);
        assert_eq!(protocol.message, "protocol error: bad count");
    }
}
