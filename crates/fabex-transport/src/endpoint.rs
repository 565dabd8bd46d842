use std::fmt;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bitflags::bitflags;
use fabex_wire::ConnectRequest;
use tracing::{debug, warn};

use crate::caps::{Capabilities, EpAttr, EpType, Info};
use crate::error::{Errno, Result, TransportError};
use crate::fabric::{Domain, Fabric};
use crate::fid::{Fid, FidKind};
use crate::queue::{CompletionQueue, EqSink, EventQueue};
use crate::tcp::{Link, ListenOffer, ListenerTask, PendingConnection};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique endpoint identifier, reported in queue events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    fn next() -> Self {
        Self(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// Lifecycle of an active endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    Created,
    Bound,
    Enabled,
    Connecting,
    Connected,
    ShuttingDown,
    Closed,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointState::Created => "created",
            EndpointState::Bound => "bound",
            EndpointState::Enabled => "enabled",
            EndpointState::Connecting => "connecting",
            EndpointState::Connected => "connected",
            EndpointState::ShuttingDown => "shutting down",
            EndpointState::Closed => "closed",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Which completions a bound queue receives.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindFlags: u64 {
        const TRANSMIT = 1 << 0;
        const RECV = 1 << 1;
    }
}

/// How much of a post the provider took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// The whole buffer was posted.
    Full,
    /// Only the first `n` bytes were posted; post the rest separately.
    Partial(usize),
}

impl Accepted {
    pub(crate) fn of(accepted: usize, requested: usize) -> Self {
        if accepted >= requested {
            Accepted::Full
        } else {
            Accepted::Partial(accepted)
        }
    }

    /// Bytes covered by this post out of `requested`.
    pub fn len(self, requested: usize) -> usize {
        match self {
            Accepted::Full => requested,
            Accepted::Partial(n) => n,
        }
    }
}

/// A connection request read from an event queue.
///
/// Carries the peer's provider info; open the accepting domain and endpoint
/// from [`ConnectionRequest::info`], or hand it back to
/// [`PassiveEndpoint::reject`].
#[derive(Debug)]
pub struct ConnectionRequest {
    pub info: Info,
}

impl ConnectionRequest {
    pub(crate) fn new(info: Info) -> Self {
        Self { info }
    }

    /// Address of the requesting peer.
    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.info.dest_addr
    }

    /// Capabilities the peer asked for.
    pub fn caps(&self) -> Capabilities {
        self.info.caps
    }
}

/// Connection-oriented endpoint that carries data.
///
/// Lifecycle: open on a domain, bind a transmit queue, a receive queue and
/// an event queue, [`enable`](Self::enable), then either
/// [`connect`](Self::connect) or, when opened from a connection request,
/// [`accept`](Self::accept). Receives may be posted as soon as the endpoint
/// is enabled; sends need the connection.
pub struct ActiveEndpoint {
    link: Arc<Link>,
    caps: Capabilities,
    ep_type: EpType,
    pending: Option<Arc<PendingConnection>>,
    connector: Option<JoinHandle<()>>,
    fid: Fid,
}

impl ActiveEndpoint {
    /// Open an endpoint on `domain`. Pass the info of a connection request
    /// to open the accepting side of that connection.
    pub fn open(domain: &Domain, info: &Info) -> Result<Self> {
        let fid = Fid::child(FidKind::ActiveEndpoint, "endpoint", &[domain.fid()])?;
        let id = EndpointId::next();
        debug!(endpoint = %id, caps = ?info.caps, "endpoint opened");
        Ok(Self {
            link: Arc::new(Link::new(id, info.ep_attr)),
            caps: info.caps,
            ep_type: info.ep_type,
            pending: info.pending.clone(),
            connector: None,
            fid,
        })
    }

    pub fn id(&self) -> EndpointId {
        self.link.id()
    }

    pub fn state(&self) -> EndpointState {
        self.link.state()
    }

    /// Largest message one post carries (negotiated once connected).
    pub fn max_msg_size(&self) -> usize {
        self.link.max_msg_size()
    }

    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.link.peer()
    }

    /// Bind a completion queue for transmit and/or receive completions.
    pub fn bind_cq(&mut self, cq: &CompletionQueue, flags: BindFlags) -> Result<()> {
        self.fid.ensure_open("ep_bind")?;
        if flags.is_empty() {
            return Err(TransportError::Fatal {
                op: "ep_bind",
                errno: Errno::InvalidArg,
            });
        }
        let tx = flags.contains(BindFlags::TRANSMIT).then(|| cq.sink());
        let rx = flags.contains(BindFlags::RECV).then(|| cq.sink());
        self.link.bind_cq(tx, rx)?;
        self.fid.pin("ep_bind", cq.fid())
    }

    /// Bind the event queue connection events are reported on.
    pub fn bind_eq(&mut self, eq: &EventQueue) -> Result<()> {
        self.fid.ensure_open("ep_bind")?;
        self.link.bind_eq(eq.sink())?;
        self.fid.pin("ep_bind", eq.fid())
    }

    /// Make the endpoint usable. Requires both completion queues and the
    /// event queue to be bound.
    pub fn enable(&mut self) -> Result<()> {
        self.fid.ensure_open("enable")?;
        self.link.enable()
    }

    /// Start connecting to `dest`. Completion is reported on the event
    /// queue as [`crate::EqEvent::Connected`] or as an error record.
    pub fn connect(&mut self, dest: SocketAddrV4) -> Result<()> {
        self.fid.ensure_open("connect")?;
        let request = ConnectRequest::new(
            self.caps.bits(),
            self.ep_type.as_str(),
            self.link.max_msg_size(),
        );
        let handle = self.link.connect(dest, request)?;
        if let Some(previous) = self.connector.replace(handle) {
            let _ = previous.join();
        }
        Ok(())
    }

    /// Accept the connection request this endpoint was opened from.
    pub fn accept(&mut self) -> Result<()> {
        self.fid.ensure_open("accept")?;
        let pending = self.pending.as_ref().ok_or(TransportError::Fatal {
            op: "accept",
            errno: Errno::InvalidArg,
        })?;
        self.link.accept(pending)
    }

    /// Post a send of `buf`. Returns how much of the buffer the provider
    /// took; the completion arrives once the peer has received it.
    pub fn send(&mut self, buf: &[u8], context: u64) -> Result<Accepted> {
        self.fid.ensure_open("send")?;
        self.link.post_send(buf, context)
    }

    /// Post a receive buffer of `len` bytes.
    pub fn recv(&mut self, len: usize, context: u64) -> Result<Accepted> {
        self.fid.ensure_open("recv")?;
        self.link.post_recv(len, context)
    }

    /// Tell the peer no more data follows and cancel outstanding posts.
    pub fn shutdown(&mut self) -> Result<()> {
        self.fid.ensure_open("shutdown")?;
        self.link.shutdown()
    }

    /// Close the endpoint and stop its provider threads.
    pub fn close(&mut self) -> Result<()> {
        if self.fid.is_closed() {
            return Ok(());
        }
        self.link.close(self.connector.take());
        self.fid.close()
    }
}

impl Drop for ActiveEndpoint {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "endpoint close failed on drop");
        }
    }
}

impl fmt::Debug for ActiveEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveEndpoint")
            .field("id", &self.link.id())
            .field("state", &self.state())
            .field("caps", &self.caps)
            .finish()
    }
}

/// Listen-only endpoint producing connection requests.
pub struct PassiveEndpoint {
    id: EndpointId,
    addr: SocketAddrV4,
    offer: ListenOffer,
    eq: Option<EqSink>,
    task: Option<ListenerTask>,
    fid: Fid,
}

impl PassiveEndpoint {
    /// Open a passive endpoint for the source address in `info`.
    pub fn open(fabric: &Fabric, info: &Info) -> Result<Self> {
        let fid = Fid::child(FidKind::PassiveEndpoint, "passive_ep", &[fabric.fid()])?;
        let addr = info
            .src_addr
            .unwrap_or_else(|| SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0));
        Ok(Self {
            id: EndpointId::next(),
            addr,
            offer: ListenOffer {
                provider: info.provider,
                fabric_name: info.fabric_name.clone(),
                domain_name: info.domain_name.clone(),
                ep_attr: info.ep_attr,
            },
            eq: None,
            task: None,
            fid,
        })
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Endpoint attributes offered to connecting peers.
    pub fn ep_attr(&self) -> EpAttr {
        self.offer.ep_attr
    }

    /// Bind the event queue connection requests are reported on.
    pub fn bind(&mut self, eq: &EventQueue) -> Result<()> {
        self.fid.ensure_open("pep_bind")?;
        if self.eq.is_some() {
            return Err(TransportError::Fatal {
                op: "pep_bind",
                errno: Errno::InvalidArg,
            });
        }
        self.fid.pin("pep_bind", eq.fid())?;
        self.eq = Some(eq.sink());
        Ok(())
    }

    /// Start accepting connection requests.
    pub fn listen(&mut self) -> Result<()> {
        self.fid.ensure_open("listen")?;
        if self.task.is_some() {
            return Ok(());
        }
        let eq = self.eq.clone().ok_or(TransportError::Fatal {
            op: "listen",
            errno: Errno::InvalidArg,
        })?;
        self.task = Some(ListenerTask::start(self.addr, self.offer.clone(), eq)?);
        Ok(())
    }

    /// Local address the endpoint listens on. Resolves an ephemeral port
    /// once listening.
    pub fn getname(&self) -> Result<SocketAddrV4> {
        self.fid.ensure_open("getname")?;
        Ok(self
            .task
            .as_ref()
            .map(ListenerTask::local_addr)
            .unwrap_or(self.addr))
    }

    /// Refuse a connection request. The peer's connect fails with
    /// connection refused and `reason` as error data.
    pub fn reject(&self, request: ConnectionRequest, reason: &str) -> Result<()> {
        self.fid.ensure_open("reject")?;
        let pending = request.info.pending.as_ref().ok_or(TransportError::Fatal {
            op: "reject",
            errno: Errno::InvalidArg,
        })?;
        pending.reject(reason)
    }

    /// Stop listening and close the endpoint.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut task) = self.task.take() {
            task.stop();
        }
        self.fid.close()
    }
}

impl fmt::Debug for PassiveEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassiveEndpoint")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("listening", &self.task.is_some())
            .finish()
    }
}
