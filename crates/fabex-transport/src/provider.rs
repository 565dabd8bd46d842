//! Provider discovery.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use bitflags::bitflags;
use fabex_wire::DEFAULT_MAX_PAYLOAD;
use tracing::debug;

use crate::caps::{Capabilities, EpAttr, EpType, Hints, Info};
use crate::error::{Errno, Result, TransportError};
use crate::fid::{Fid, FidKind};

bitflags! {
    /// Flags modifying how [`getinfo`] interprets `node`/`service`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GetInfoFlags: u64 {
        /// `node`/`service` name the local (source) address to listen on
        /// instead of a destination.
        const SOURCE = 1 << 57;
    }
}

/// Static description of a provider compiled into this crate.
#[derive(Debug, Clone, Copy)]
pub struct ProviderDescriptor {
    pub name: &'static str,
    pub fabric_name: &'static str,
    pub domain_name: &'static str,
    pub caps: Capabilities,
    pub ep_types: &'static [EpType],
    pub max_msg_size: usize,
    pub tx_size: usize,
    pub rx_size: usize,
}

impl ProviderDescriptor {
    fn default_ep_attr(&self) -> EpAttr {
        EpAttr {
            max_msg_size: self.max_msg_size,
            tx_size: self.tx_size,
            rx_size: self.rx_size,
        }
    }

    fn serves(&self, hints: &Hints) -> bool {
        self.caps.contains(hints.caps) && self.ep_types.contains(&hints.ep_type)
    }
}

/// Reliable-connection provider over TCP sockets.
pub const PROVIDER_TCP: ProviderDescriptor = ProviderDescriptor {
    name: "tcp",
    fabric_name: "fabex-tcp",
    domain_name: "tcp0",
    caps: Capabilities::MSG
        .union(Capabilities::SEND)
        .union(Capabilities::RECV),
    ep_types: &[EpType::Msg],
    max_msg_size: 64 * 1024,
    tx_size: 64,
    rx_size: 64,
};

/// Largest message one post may carry. A DATA frame holds the message body
/// plus its 8-byte sequence number and must fit one wire frame.
pub const MAX_MSG_SIZE: usize = DEFAULT_MAX_PAYLOAD - std::mem::size_of::<u64>();

static PROVIDERS: &[ProviderDescriptor] = &[PROVIDER_TCP];

/// Providers compiled into this crate.
pub fn providers() -> &'static [ProviderDescriptor] {
    PROVIDERS
}

/// Look up a compiled-in provider by name.
pub(crate) fn find_provider(name: &str) -> Option<&'static ProviderDescriptor> {
    PROVIDERS.iter().find(|provider| provider.name == name)
}

/// Resolve `hints` against the available providers.
///
/// With [`GetInfoFlags::SOURCE`] the `node`/`service` pair names the local
/// address to listen on (`node` defaults to `0.0.0.0`, port 0 means an
/// ephemeral port). Without it the pair names the destination; leaving both
/// out produces an unscoped descriptor for a connecting endpoint.
pub fn getinfo(
    hints: &Hints,
    node: Option<&str>,
    service: Option<&str>,
    flags: GetInfoFlags,
) -> Result<Info> {
    let provider = PROVIDERS
        .iter()
        .find(|provider| provider.serves(hints))
        .ok_or_else(|| TransportError::ResourceUnavailable {
            requested: hints.caps,
            available: PROVIDERS
                .iter()
                .map(|provider| provider.caps)
                .reduce(|a, b| a | b),
        })?;

    let ep_attr = match hints.ep_attr {
        Some(attr) => validate_attr(attr)?,
        None => provider.default_ep_attr(),
    };

    let (src_addr, dest_addr) = if flags.contains(GetInfoFlags::SOURCE) {
        let addr = resolve(node.unwrap_or("0.0.0.0"), service.unwrap_or("0"))?;
        (Some(addr), None)
    } else {
        match (node, service) {
            (None, None) => (None, None),
            (node, service) => {
                let addr = resolve(node.unwrap_or("127.0.0.1"), service.unwrap_or("0"))?;
                (None, Some(addr))
            }
        }
    };

    debug!(
        provider = provider.name,
        caps = ?hints.caps,
        ep_type = %hints.ep_type,
        ?src_addr,
        ?dest_addr,
        "provider resolved"
    );

    Ok(Info {
        provider: provider.name,
        fabric_name: provider.fabric_name.to_string(),
        domain_name: provider.domain_name.to_string(),
        caps: hints.caps,
        ep_type: hints.ep_type,
        ep_attr,
        src_addr,
        dest_addr,
        pending: None,
        fid: Fid::new(FidKind::Info),
    })
}

/// Reject empty attributes and clamp the message size to what one frame
/// can carry.
fn validate_attr(mut attr: EpAttr) -> Result<EpAttr> {
    if attr.max_msg_size == 0 || attr.tx_size == 0 || attr.rx_size == 0 {
        return Err(TransportError::Fatal {
            op: "getinfo",
            errno: Errno::InvalidArg,
        });
    }
    if attr.max_msg_size > MAX_MSG_SIZE {
        debug!(
            requested = attr.max_msg_size,
            limit = MAX_MSG_SIZE,
            "clamping max_msg_size"
        );
        attr.max_msg_size = MAX_MSG_SIZE;
    }
    Ok(attr)
}

/// Resolve a node/service pair to an IPv4 socket address.
pub(crate) fn resolve(node: &str, service: &str) -> Result<SocketAddrV4> {
    let port: u16 = service.parse().map_err(|_| TransportError::Fatal {
        op: "getinfo",
        errno: Errno::InvalidArg,
    })?;
    if let Ok(ip) = node.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(ip, port));
    }
    let addrs = (node, port)
        .to_socket_addrs()
        .map_err(|err| TransportError::Fatal {
            op: "getinfo",
            errno: Errno::from_io(&err),
        })?;
    addrs
        .into_iter()
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or(TransportError::Fatal {
            op: "getinfo",
            errno: Errno::NoData,
        })
}
