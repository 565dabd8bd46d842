use std::fmt;
use std::net::SocketAddrV4;

use fabex_transport::{EqEvent, EventQueue, TransportError};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::context::{FabricContext, Role};
use crate::error::Result;
use crate::exchange::{Exchange, FabricEndpoint, PendingRecv};

/// Client connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    AwaitingPeer,
    Connected,
    ShuttingDown,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Idle => "idle",
            ClientState::AwaitingPeer => "awaiting peer",
            ClientState::Connected => "connected",
            ClientState::ShuttingDown => "shutting down",
            ClientState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connected client side of an exchange.
pub struct ClientSession {
    // Declared before the context: the endpoint and its queues go first.
    exchange: Exchange<FabricEndpoint>,
    context: FabricContext,
    preposted: Option<PendingRecv>,
    peer: SocketAddrV4,
    state: ClientState,
}

impl ClientSession {
    /// Open the client resources, pre-post the first receive and connect
    /// to `dest`. Returns once the connection is established.
    pub fn connect(dest: SocketAddrV4, config: &SessionConfig) -> Result<Self> {
        let context = FabricContext::open(Role::Client, config)?;
        let endpoint = FabricEndpoint::open(
            context.require_domain("connect")?,
            context.eq(),
            context.info(),
            config.cq_attr,
        )?;
        let mut exchange = Exchange::new(endpoint);

        let preposted = if config.prepost_bytes > 0 {
            Some(exchange.post_recv(config.prepost_bytes)?)
        } else {
            None
        };

        debug!(%dest, state = %ClientState::AwaitingPeer, "connecting");
        exchange.endpoint_mut().endpoint.connect(dest)?;
        wait_connected(context.eq())?;
        info!(%dest, mode = %config.mode, "connected");

        Ok(Self {
            exchange,
            context,
            preposted,
            peer: dest,
            state: ClientState::Connected,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn context(&self) -> &FabricContext {
        &self.context
    }

    pub fn exchange_mut(&mut self) -> &mut Exchange<FabricEndpoint> {
        &mut self.exchange
    }

    /// Hand out the receive posted before connecting, once.
    pub fn take_preposted(&mut self) -> Option<PendingRecv> {
        self.preposted.take()
    }

    /// Tell the peer the exchange is over. Outstanding receives, including
    /// an unused pre-posted one, are cancelled.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state != ClientState::Connected {
            return Ok(());
        }
        self.state = ClientState::ShuttingDown;
        if let Some(pending) = self.preposted.take() {
            debug!(len = pending.len(), "cancelling unused pre-posted receive");
        }
        self.exchange.endpoint_mut().endpoint.shutdown()?;
        Ok(())
    }

    /// Shut down if still connected and release every resource in
    /// teardown order.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()?;
        self.exchange.endpoint_mut().close()?;
        self.state = ClientState::Closed;
        self.context.close()?;
        debug!(peer = %self.peer, "client closed");
        Ok(())
    }
}

/// Block on `eq` until the connection is reported established.
fn wait_connected(eq: &EventQueue) -> Result<()> {
    loop {
        match eq.sread(None) {
            Ok(EqEvent::Connected { fid }) => {
                debug!(endpoint = %fid, "connection established");
                return Ok(());
            }
            Ok(event) => debug!(event = event.name(), "ignoring event while connecting"),
            Err(TransportError::ErrorAvailable { .. }) => {
                let entry = eq.readerr()?;
                warn!(
                    error = %entry.err,
                    detail = %String::from_utf8_lossy(&entry.err_data),
                    "connect failed"
                );
                return Err(TransportError::EventQueue(entry).into());
            }
            Err(err @ TransportError::Closed { .. }) => return Err(err.into()),
            Err(err) => warn!(error = %err, status = err.errno().status(), "event queue read failed; waiting"),
        }
    }
}
