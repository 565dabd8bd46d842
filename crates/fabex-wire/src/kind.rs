//! Frame kinds.
//!
//! Kind 0 is never sent, so a zeroed header is invalid.

use std::fmt;

use crate::error::FrameError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Connection request carrying the requester's provider info.
    ConnReq = 1,
    /// Accept or reject answer to a connection request.
    ConnResp = 2,
    /// One application message (one posted send).
    Data = 3,
    /// Delivery acknowledgement for a DATA message matched to a posted receive.
    Ack = 4,
    /// Orderly shutdown notice.
    Shutdown = 5,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::ConnReq => "CONN_REQ",
            FrameKind::ConnResp => "CONN_RESP",
            FrameKind::Data => "DATA",
            FrameKind::Ack => "ACK",
            FrameKind::Shutdown => "SHUTDOWN",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => FrameKind::ConnReq,
            2 => FrameKind::ConnResp,
            3 => FrameKind::Data,
            4 => FrameKind::Ack,
            5 => FrameKind::Shutdown,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
