use tracing::debug;

use crate::caps::{EpAttr, Info};
use crate::error::{Errno, Result, TransportError};
use crate::fid::{Fid, FidKind};
use crate::provider::find_provider;

/// Top-level provider instance opened from an [`Info`] descriptor.
#[derive(Debug)]
pub struct Fabric {
    provider: &'static str,
    name: String,
    fid: Fid,
}

impl Fabric {
    /// Open the fabric described by `info`. The descriptor stays pinned
    /// until the fabric closes.
    pub fn open(info: &Info) -> Result<Self> {
        if find_provider(info.provider).is_none() {
            return Err(TransportError::Fatal {
                op: "fabric",
                errno: Errno::NoData,
            });
        }
        let fid = Fid::child(FidKind::Fabric, "fabric", &[&info.fid])?;
        debug!(provider = info.provider, fabric = %info.fabric_name, "fabric opened");
        Ok(Self {
            provider: info.provider,
            name: info.fabric_name.clone(),
            fid,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the fabric. Fails while domains, event queues or passive
    /// endpoints opened on it are still open.
    pub fn close(&mut self) -> Result<()> {
        self.fid.close()
    }

    pub fn is_closed(&self) -> bool {
        self.fid.is_closed()
    }

    pub(crate) fn fid(&self) -> &Fid {
        &self.fid
    }
}

/// Resource domain; completion queues and active endpoints live on it.
#[derive(Debug)]
pub struct Domain {
    name: String,
    ep_attr: EpAttr,
    fid: Fid,
}

impl Domain {
    /// Open a domain on `fabric` for the provider described by `info`.
    ///
    /// On the listening side `info` is the one carried by the connection
    /// request, so the domain matches what the peer asked for.
    pub fn open(fabric: &Fabric, info: &Info) -> Result<Self> {
        if info.provider != fabric.provider {
            return Err(TransportError::Fatal {
                op: "domain",
                errno: Errno::InvalidArg,
            });
        }
        let fid = Fid::child(FidKind::Domain, "domain", &[fabric.fid()])?;
        debug!(domain = %info.domain_name, "domain opened");
        Ok(Self {
            name: info.domain_name.clone(),
            ep_attr: info.ep_attr,
            fid,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint attributes of the descriptor the domain was opened from.
    pub fn ep_attr(&self) -> EpAttr {
        self.ep_attr
    }

    /// Close the domain. Fails while completion queues or endpoints opened
    /// on it are still open.
    pub fn close(&mut self) -> Result<()> {
        self.fid.close()
    }

    pub fn is_closed(&self) -> bool {
        self.fid.is_closed()
    }

    pub(crate) fn fid(&self) -> &Fid {
        &self.fid
    }
}
