//! Transport resources owned by one session role.
//!
//! A [`FabricContext`] holds the provider descriptor, fabric, event queue,
//! the domain once one exists and, on the listening side, the passive
//! endpoint. Fields are declared in teardown order, so dropping a context
//! releases resources in the same order [`FabricContext::close`] does.

use std::fmt;

use fabex_transport::{
    getinfo, CompletionQueue, CqAttr, Domain, Errno, EventQueue, Fabric, GetInfoFlags, Hints,
    Info, PassiveEndpoint, TransportError,
};
use serde::Serialize;
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::Result;

/// Which side of the exchange a context serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Transmit and receive completion queues of one endpoint.
pub struct CompletionQueuePair {
    pub tx: CompletionQueue,
    pub rx: CompletionQueue,
}

impl CompletionQueuePair {
    pub fn open(domain: &Domain, attr: CqAttr) -> Result<Self> {
        Ok(Self {
            tx: CompletionQueue::open(domain, attr)?,
            rx: CompletionQueue::open(domain, attr)?,
        })
    }

    pub fn close(&mut self) -> Result<()> {
        self.tx.close()?;
        self.rx.close()?;
        Ok(())
    }
}

/// Resources one role opens before any endpoint exists.
pub struct FabricContext {
    domain: Option<Domain>,
    passive: Option<PassiveEndpoint>,
    eq: EventQueue,
    fabric: Fabric,
    info: Info,
    role: Role,
}

impl FabricContext {
    /// Resolve the provider and open fabric and event queue. The client
    /// role opens its domain immediately; the server opens one per
    /// accepted connection.
    pub fn open(role: Role, config: &SessionConfig) -> Result<Self> {
        let mut hints = Hints::new(config.mode.caps());
        hints.ep_attr = config.ep_attr;

        let info = match role {
            Role::Server => {
                let port = config.port.to_string();
                getinfo(
                    &hints,
                    config.bind_addr.as_deref(),
                    Some(&port),
                    GetInfoFlags::SOURCE,
                )?
            }
            Role::Client => getinfo(&hints, None, None, GetInfoFlags::empty())?,
        };
        let fabric = Fabric::open(&info)?;
        let eq = EventQueue::open(&fabric, config.eq_attr)?;
        let domain = match role {
            Role::Client => Some(Domain::open(&fabric, &info)?),
            Role::Server => None,
        };
        debug!(%role, provider = info.provider, mode = %config.mode, "fabric context opened");

        Ok(Self {
            domain,
            passive: None,
            eq,
            fabric,
            info,
            role,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub fn eq(&self) -> &EventQueue {
        &self.eq
    }

    pub fn domain(&self) -> Option<&Domain> {
        self.domain.as_ref()
    }

    /// The domain, or an error naming `op` when none is open yet.
    pub(crate) fn require_domain(&self, op: &'static str) -> Result<&Domain> {
        self.domain.as_ref().ok_or_else(|| {
            TransportError::Fatal {
                op,
                errno: Errno::InvalidArg,
            }
            .into()
        })
    }

    /// Open the domain for an accepted connection from the request's info.
    pub fn open_domain(&mut self, info: &Info) -> Result<&Domain> {
        if self.domain.is_some() {
            return Err(TransportError::Fatal {
                op: "domain",
                errno: Errno::Busy,
            }
            .into());
        }
        Ok(&*self.domain.insert(Domain::open(&self.fabric, info)?))
    }

    /// Open, bind and keep the passive endpoint of the listening role.
    pub(crate) fn open_passive(&mut self) -> Result<&mut PassiveEndpoint> {
        let mut pep = PassiveEndpoint::open(&self.fabric, &self.info)?;
        pep.bind(&self.eq)?;
        Ok(self.passive.insert(pep))
    }

    pub fn passive(&self) -> Option<&PassiveEndpoint> {
        self.passive.as_ref()
    }

    /// Release everything in teardown order: domain, passive endpoint,
    /// event queue, fabric, info. Endpoints and completion queues opened on
    /// the domain must already be closed.
    pub fn close(mut self) -> Result<()> {
        if let Some(domain) = self.domain.as_mut() {
            domain.close()?;
        }
        if let Some(passive) = self.passive.as_mut() {
            passive.close()?;
        }
        self.eq.close()?;
        self.fabric.close()?;
        self.info.close()?;
        debug!(role = %self.role, "fabric context closed");
        Ok(())
    }
}

impl fmt::Debug for FabricContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricContext")
            .field("role", &self.role)
            .field("provider", &self.info.provider)
            .field("domain", &self.domain.is_some())
            .field("passive", &self.passive.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommMode;

    #[test]
    fn client_context_opens_domain() {
        let context = FabricContext::open(Role::Client, &SessionConfig::default())
            .expect("client context should open");
        assert!(context.domain().is_some());
        assert!(context.info().src_addr.is_none());
        context.close().expect("context should close");
    }

    #[test]
    fn server_context_defers_domain() {
        let config = SessionConfig::default()
            .with_port(0)
            .with_mode(CommMode::OneWay);
        let context = FabricContext::open(Role::Server, &config).expect("server context should open");
        assert!(context.domain().is_none());
        assert_eq!(context.info().src_addr.map(|addr| addr.port()), Some(0));
        context.close().expect("context should close");
    }

    #[test]
    fn close_refuses_while_queues_open() {
        let context = FabricContext::open(Role::Client, &SessionConfig::default())
            .expect("client context should open");
        let domain = context.domain().expect("client has a domain");
        let mut cqs = CompletionQueuePair::open(domain, CqAttr::default()).expect("cqs should open");

        // Closing now would violate the teardown order.
        let err = context.close().expect_err("domain still has queues");
        assert!(matches!(
            err,
            crate::SessionError::Transport(TransportError::TeardownOrderViolation { .. })
        ));
        cqs.close().expect("cqs close after a failed context close");
    }

    #[test]
    fn second_domain_is_refused() {
        let mut context = FabricContext::open(Role::Client, &SessionConfig::default())
            .expect("client context should open");
        let info = getinfo(&Hints::default(), None, None, GetInfoFlags::empty()).unwrap();
        assert!(context.open_domain(&info).is_err());
    }
}
