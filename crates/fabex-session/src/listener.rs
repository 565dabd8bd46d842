use std::fmt;
use std::net::SocketAddrV4;
use std::time::Duration;

use fabex_transport::{ConnectionRequest, EqEvent, EventQueue, TransportError};
use tracing::{debug, info, warn};

use crate::config::{CommMode, SessionConfig};
use crate::context::{FabricContext, Role};
use crate::error::{Result, SessionError};
use crate::exchange::{Exchange, FabricEndpoint, PendingRecv};

/// Server connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    RequestReceived,
    Accepting,
    Connected,
    ShuttingDown,
    Closed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Idle => "idle",
            ServerState::Listening => "listening",
            ServerState::RequestReceived => "request received",
            ServerState::Accepting => "accepting",
            ServerState::Connected => "connected",
            ServerState::ShuttingDown => "shutting down",
            ServerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Listening server waiting for its one connection.
pub struct Listener {
    context: FabricContext,
    local_addr: SocketAddrV4,
    config: SessionConfig,
}

impl Listener {
    /// Open the server resources and start listening on the configured
    /// port.
    pub fn bind(config: &SessionConfig) -> Result<Self> {
        let mut context = FabricContext::open(Role::Server, config)?;
        let passive = context.open_passive()?;
        passive.listen()?;
        let local_addr = passive.getname()?;
        info!(addr = %local_addr, mode = %config.mode, state = %ServerState::Listening, "listening");
        Ok(Self {
            context,
            local_addr,
            config: config.clone(),
        })
    }

    /// Address the server listens on, as `address:port`.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Wait for a connection request and accept it.
    ///
    /// A request whose capabilities share nothing with this server's is
    /// rejected before any domain or endpoint is created, and reported as
    /// resource unavailable.
    pub fn accept(mut self) -> Result<ServerSession> {
        let request = wait_request(self.context.eq(), self.config.request_timeout)?;
        let peer = request.peer();
        debug!(peer = ?peer, caps = ?request.caps(), state = %ServerState::RequestReceived, "connection request");

        let available = self.context.info().caps;
        if !request.caps().intersects(available) {
            let requested = request.caps();
            warn!(peer = ?peer, ?requested, ?available, "rejecting request with unsupported capabilities");
            if let Some(passive) = self.context.passive() {
                passive.reject(request, "unsupported capabilities")?;
            }
            return Err(TransportError::ResourceUnavailable {
                requested,
                available: Some(available),
            }
            .into());
        }

        debug!(peer = ?peer, state = %ServerState::Accepting, "accepting");
        let ConnectionRequest { info: mut request_info } = request;
        self.context.open_domain(&request_info)?;
        let endpoint = FabricEndpoint::open(
            self.context.require_domain("accept")?,
            self.context.eq(),
            &request_info,
            self.config.cq_attr,
        )?;
        request_info.close()?;
        let mut exchange = Exchange::new(endpoint);

        let preposted = if self.config.prepost_bytes > 0 {
            Some(exchange.post_recv(self.config.prepost_bytes)?)
        } else {
            None
        };
        exchange.endpoint_mut().endpoint.accept()?;
        wait_confirmed(
            self.context.eq(),
            self.config.confirm_timeout,
            self.config.confirm_retries.max(1),
        )?;
        let peer = exchange.endpoint().endpoint.peer_addr().or(peer);
        info!(peer = ?peer, "connection accepted");

        Ok(ServerSession {
            exchange,
            context: self.context,
            preposted,
            peer,
            state: ServerState::Connected,
        })
    }

    pub fn mode(&self) -> CommMode {
        self.config.mode
    }

    /// Stop listening without accepting.
    pub fn close(self) -> Result<()> {
        self.context.close()
    }
}

/// Connected server side of an exchange.
pub struct ServerSession {
    exchange: Exchange<FabricEndpoint>,
    context: FabricContext,
    preposted: Option<PendingRecv>,
    peer: Option<SocketAddrV4>,
    state: ServerState,
}

impl ServerSession {
    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    pub fn context(&self) -> &FabricContext {
        &self.context
    }

    pub fn exchange_mut(&mut self) -> &mut Exchange<FabricEndpoint> {
        &mut self.exchange
    }

    /// Hand out the receive posted before accepting, once.
    pub fn take_preposted(&mut self) -> Option<PendingRecv> {
        self.preposted.take()
    }

    pub fn shutdown(&mut self) -> Result<()> {
        if self.state != ServerState::Connected {
            return Ok(());
        }
        self.state = ServerState::ShuttingDown;
        self.preposted = None;
        self.exchange.endpoint_mut().endpoint.shutdown()?;
        Ok(())
    }

    /// Shut down if still connected and release every resource in
    /// teardown order.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()?;
        self.exchange.endpoint_mut().close()?;
        self.state = ServerState::Closed;
        self.context.close()?;
        debug!(peer = ?self.peer, "server closed");
        Ok(())
    }
}

fn wait_request(eq: &EventQueue, timeout: Option<Duration>) -> Result<ConnectionRequest> {
    loop {
        match eq.sread(timeout) {
            Ok(EqEvent::ConnReq(request)) => return Ok(request),
            Ok(event) => debug!(event = event.name(), "ignoring event while listening"),
            Err(TransportError::Again { .. }) if timeout.is_some() => {
                return Err(SessionError::RequestTimeout(timeout.unwrap_or_default()))
            }
            Err(TransportError::ErrorAvailable { .. }) => {
                let entry = eq.readerr()?;
                return Err(TransportError::EventQueue(entry).into());
            }
            Err(err @ TransportError::Closed { .. }) => return Err(err.into()),
            Err(err) => warn!(error = %err, status = err.errno().status(), "event queue read failed; waiting"),
        }
    }
}

/// Wait for the accepted connection to be confirmed, `attempts` waits of
/// `timeout` each.
fn wait_confirmed(eq: &EventQueue, timeout: Duration, attempts: u32) -> Result<()> {
    let mut attempt = 1;
    loop {
        match eq.sread(Some(timeout)) {
            Ok(EqEvent::Connected { fid }) => {
                debug!(endpoint = %fid, attempt, "connection confirmed");
                return Ok(());
            }
            Ok(event) => debug!(event = event.name(), "ignoring event while accepting"),
            Err(TransportError::Again { .. }) => {
                warn!(attempt, attempts, ?timeout, "connection not yet confirmed");
                if attempt >= attempts {
                    return Err(SessionError::ConfirmTimeout { attempts, timeout });
                }
                attempt += 1;
            }
            Err(TransportError::ErrorAvailable { .. }) => {
                let entry = eq.readerr()?;
                return Err(TransportError::EventQueue(entry).into());
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use fabex_transport::{getinfo, Fabric, GetInfoFlags, Hints};

    use super::*;

    #[test]
    fn confirmation_gives_up_after_retries() {
        let mut info = getinfo(&Hints::default(), None, None, GetInfoFlags::empty())
            .expect("provider should resolve");
        let mut fabric = Fabric::open(&info).expect("fabric should open");
        let mut eq = EventQueue::open(&fabric, Default::default()).expect("eq should open");

        let err = wait_confirmed(&eq, Duration::from_millis(20), 2).unwrap_err();
        match err {
            SessionError::ConfirmTimeout { attempts, timeout } => {
                assert_eq!(attempts, 2);
                assert_eq!(timeout, Duration::from_millis(20));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(SessionError::ConfirmTimeout {
            attempts: 2,
            timeout: Duration::ZERO
        }
        .is_timeout());

        eq.close().expect("eq close");
        fabric.close().expect("fabric close");
        info.close().expect("info close");
    }

    #[test]
    fn request_wait_can_be_bounded() {
        let config = SessionConfig::default().with_port(0);
        let listener = Listener::bind(&config.with_request_timeout(Duration::from_millis(50)))
            .expect("listener should bind");
        assert_ne!(listener.local_addr().port(), 0);
        let err = listener.accept().err().expect("nothing connects");
        assert!(matches!(err, SessionError::RequestTimeout(_)));
    }
}
