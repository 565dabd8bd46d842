use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::Result;
use crate::fid::Fid;
use crate::tcp::PendingConnection;

bitflags! {
    /// Capabilities a provider offers or a caller requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u64 {
        const MSG = 1 << 1;
        const RMA = 1 << 2;
        const TAGGED = 1 << 3;
        const ATOMIC = 1 << 4;
        const READ = 1 << 8;
        const WRITE = 1 << 9;
        const RECV = 1 << 10;
        const SEND = 1 << 11;
    }
}

/// Endpoint type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpType {
    /// Reliable, connection-oriented.
    Msg,
    /// Reliable, connectionless.
    Rdm,
    /// Unreliable datagrams.
    Dgram,
}

impl EpType {
    pub fn as_str(self) -> &'static str {
        match self {
            EpType::Msg => "msg",
            EpType::Rdm => "rdm",
            EpType::Dgram => "dgram",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "msg" => Some(EpType::Msg),
            "rdm" => Some(EpType::Rdm),
            "dgram" => Some(EpType::Dgram),
            _ => None,
        }
    }
}

impl fmt::Display for EpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpAttr {
    /// Largest message one post may carry; larger posts are partially accepted.
    pub max_msg_size: usize,
    /// Sends that may be outstanding (not yet completed) at once.
    pub tx_size: usize,
    /// Receives that may be posted at once.
    pub rx_size: usize,
}

impl Default for EpAttr {
    fn default() -> Self {
        Self {
            max_msg_size: 64 * 1024,
            tx_size: 64,
            rx_size: 64,
        }
    }
}

/// Requested provider attributes passed to [`crate::getinfo`].
#[derive(Debug, Clone)]
pub struct Hints {
    pub caps: Capabilities,
    pub ep_type: EpType,
    /// Overrides for the provider's default endpoint attributes.
    pub ep_attr: Option<EpAttr>,
}

impl Hints {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            ..Self::default()
        }
    }

    pub fn with_ep_attr(mut self, attr: EpAttr) -> Self {
        self.ep_attr = Some(attr);
        self
    }
}

impl Default for Hints {
    fn default() -> Self {
        Self {
            caps: Capabilities::SEND | Capabilities::RECV,
            ep_type: EpType::Msg,
            ep_attr: None,
        }
    }
}

/// Provider info descriptor.
///
/// Returned by [`crate::getinfo`] or carried by a connection request. The
/// descriptor is itself an object in the teardown order: a fabric opened from
/// it pins it until the fabric closes.
pub struct Info {
    pub provider: &'static str,
    pub fabric_name: String,
    pub domain_name: String,
    pub caps: Capabilities,
    pub ep_type: EpType,
    pub ep_attr: EpAttr,
    pub src_addr: Option<SocketAddrV4>,
    pub dest_addr: Option<SocketAddrV4>,
    pub(crate) pending: Option<Arc<PendingConnection>>,
    pub(crate) fid: Fid,
}

impl Info {
    /// Release the descriptor. Fails while a fabric opened from it is open.
    pub fn close(&mut self) -> Result<()> {
        self.fid.close()
    }

    pub fn is_closed(&self) -> bool {
        self.fid.is_closed()
    }
}

impl fmt::Debug for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Info")
            .field("provider", &self.provider)
            .field("fabric_name", &self.fabric_name)
            .field("domain_name", &self.domain_name)
            .field("caps", &self.caps)
            .field("ep_type", &self.ep_type)
            .field("ep_attr", &self.ep_attr)
            .field("src_addr", &self.src_addr)
            .field("dest_addr", &self.dest_addr)
            .field("connection_request", &self.pending.is_some())
            .finish()
    }
}
