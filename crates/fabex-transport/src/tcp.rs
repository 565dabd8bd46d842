//! Socket plumbing behind the tcp provider.
//!
//! A connected endpoint is a [`Link`]: shared state guarded by one mutex,
//! one writer thread fed through a channel, and one reader thread that turns
//! incoming frames into completions. DATA messages are acknowledged only
//! after they matched a posted receive, and the sender's completion is
//! generated from that acknowledgement.

use std::collections::VecDeque;
use std::net::{Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use fabex_wire::{
    ConnectRequest, ConnectResponse, FrameReader, FrameWriter, WireMessage, PROTOCOL_NAME,
};
use tracing::{debug, info, trace, warn};

use crate::caps::{Capabilities, EpAttr, EpType, Info};
use crate::endpoint::{Accepted, ConnectionRequest, EndpointId, EndpointState};
use crate::error::{Errno, Result, TransportError};
use crate::fid::{Fid, FidKind};
use crate::queue::{
    Completion, CompletionFlags, CqErrEntry, CqSink, EqErrEntry, EqEvent, EqSink,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Socket of a connection request that has not been accepted or rejected.
pub(crate) struct PendingConnection {
    conn: Mutex<Option<Handshake>>,
    peer: SocketAddrV4,
}

pub(crate) struct Handshake {
    reader: FrameReader<TcpStream>,
    stream: TcpStream,
}

impl PendingConnection {
    fn new(reader: FrameReader<TcpStream>, stream: TcpStream, peer: SocketAddrV4) -> Self {
        Self {
            conn: Mutex::new(Some(Handshake { reader, stream })),
            peer,
        }
    }

    pub(crate) fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    fn take(&self, op: &'static str) -> Result<Handshake> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(TransportError::Fatal {
                op,
                errno: Errno::InvalidArg,
            })
    }

    /// Answer the request with a rejection and drop the socket.
    pub(crate) fn reject(&self, reason: &str) -> Result<()> {
        let conn = self.take("reject")?;
        let result = FrameWriter::new(&conn.stream)
            .write_message(WireMessage::ConnResp(ConnectResponse::reject(reason)));
        let _ = conn.stream.shutdown(Shutdown::Both);
        result?;
        info!(peer = %self.peer, reason, "connection request rejected");
        Ok(())
    }
}

struct InflightSend {
    seq: u64,
    context: u64,
    len: usize,
}

struct PostedRecv {
    context: u64,
    len: usize,
}

#[derive(Default)]
struct IoThreads {
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

struct LinkState {
    endpoint: EndpointState,
    tx_cq: Option<CqSink>,
    rx_cq: Option<CqSink>,
    eq: Option<EqSink>,
    attr: EpAttr,
    next_seq: u64,
    inflight: VecDeque<InflightSend>,
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<(u64, Bytes)>,
    outbound: Option<Sender<WireMessage>>,
    socket: Option<TcpStream>,
    peer: Option<SocketAddrV4>,
    shutdown_sent: bool,
}

impl LinkState {
    fn deliver(&mut self, recv: PostedRecv, seq: u64, payload: Bytes) {
        let len = payload.len();
        if let Some(rx) = &self.rx_cq {
            if len > recv.len {
                warn!(seq, len, buffer = recv.len, "message truncated");
                rx.fail(CqErrEntry {
                    context: recv.context,
                    flags: CompletionFlags::RECV,
                    err: Errno::Truncated,
                    len,
                });
            } else {
                rx.complete(Completion {
                    context: recv.context,
                    flags: CompletionFlags::RECV,
                    len,
                    data: Some(payload),
                    completed_at: Instant::now(),
                });
            }
        }
        if self.enqueue(WireMessage::Ack { seq }).is_err() {
            debug!(seq, "acknowledgement not sent; writer gone");
        }
    }

    fn enqueue(&self, message: WireMessage) -> std::result::Result<(), Errno> {
        let outbound = self.outbound.as_ref().ok_or(Errno::NotConn)?;
        outbound.send(message).map_err(|_| Errno::ConnReset)
    }

    fn cancel_outstanding(&mut self, err: Errno) {
        for recv in self.posted.drain(..) {
            if let Some(rx) = &self.rx_cq {
                rx.fail(CqErrEntry {
                    context: recv.context,
                    flags: CompletionFlags::RECV,
                    err,
                    len: recv.len,
                });
            }
        }
        for send in self.inflight.drain(..) {
            if let Some(tx) = &self.tx_cq {
                tx.fail(CqErrEntry {
                    context: send.context,
                    flags: CompletionFlags::SEND,
                    err,
                    len: send.len,
                });
            }
        }
        self.unexpected.clear();
    }
}

/// Shared state of one active endpoint and its provider threads.
pub(crate) struct Link {
    id: EndpointId,
    state: Mutex<LinkState>,
    threads: Mutex<IoThreads>,
}

type HandshakeResult<T> = std::result::Result<T, (Errno, String)>;

fn io_failure(err: std::io::Error) -> (Errno, String) {
    (Errno::from_io(&err), err.to_string())
}

fn transport_failure(err: TransportError) -> (Errno, String) {
    (err.errno(), err.to_string())
}

impl Link {
    pub(crate) fn new(id: EndpointId, attr: EpAttr) -> Self {
        Self {
            id,
            state: Mutex::new(LinkState {
                endpoint: EndpointState::Created,
                tx_cq: None,
                rx_cq: None,
                eq: None,
                attr,
                next_seq: 0,
                inflight: VecDeque::new(),
                posted: VecDeque::new(),
                unexpected: VecDeque::new(),
                outbound: None,
                socket: None,
                peer: None,
                shutdown_sent: false,
            }),
            threads: Mutex::new(IoThreads::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn id(&self) -> EndpointId {
        self.id
    }

    pub(crate) fn state(&self) -> EndpointState {
        self.lock().endpoint
    }

    pub(crate) fn max_msg_size(&self) -> usize {
        self.lock().attr.max_msg_size
    }

    pub(crate) fn peer(&self) -> Option<SocketAddrV4> {
        self.lock().peer
    }

    pub(crate) fn bind_cq(&self, tx: Option<CqSink>, rx: Option<CqSink>) -> Result<()> {
        let mut st = self.lock();
        require_unenabled(&st, "ep_bind")?;
        if (tx.is_some() && st.tx_cq.is_some()) || (rx.is_some() && st.rx_cq.is_some()) {
            return Err(TransportError::Fatal {
                op: "ep_bind",
                errno: Errno::InvalidArg,
            });
        }
        if tx.is_some() {
            st.tx_cq = tx;
        }
        if rx.is_some() {
            st.rx_cq = rx;
        }
        st.endpoint = EndpointState::Bound;
        Ok(())
    }

    pub(crate) fn bind_eq(&self, eq: EqSink) -> Result<()> {
        let mut st = self.lock();
        require_unenabled(&st, "ep_bind")?;
        if st.eq.is_some() {
            return Err(TransportError::Fatal {
                op: "ep_bind",
                errno: Errno::InvalidArg,
            });
        }
        st.eq = Some(eq);
        st.endpoint = EndpointState::Bound;
        Ok(())
    }

    pub(crate) fn enable(&self) -> Result<()> {
        let mut st = self.lock();
        if st.endpoint == EndpointState::Enabled {
            return Ok(());
        }
        require_unenabled(&st, "enable")?;
        if st.tx_cq.is_none() || st.rx_cq.is_none() || st.eq.is_none() {
            return Err(TransportError::InvalidState {
                op: "enable",
                state: st.endpoint,
                required: "bound transmit queue, receive queue and event queue",
            });
        }
        st.endpoint = EndpointState::Enabled;
        Ok(())
    }

    pub(crate) fn post_send(&self, buf: &[u8], context: u64) -> Result<Accepted> {
        let mut st = self.lock();
        if st.endpoint != EndpointState::Connected {
            return Err(TransportError::InvalidState {
                op: "send",
                state: st.endpoint,
                required: "connected",
            });
        }
        if st.inflight.len() >= st.attr.tx_size {
            return Err(TransportError::Again { op: "send" });
        }
        let len = buf.len().min(st.attr.max_msg_size);
        let seq = st.next_seq;
        st.enqueue(WireMessage::Data {
            seq,
            payload: Bytes::copy_from_slice(&buf[..len]),
        })
        .map_err(|errno| TransportError::Fatal { op: "send", errno })?;
        st.next_seq += 1;
        st.inflight.push_back(InflightSend { seq, context, len });
        trace!(endpoint = %self.id, seq, len, "send posted");
        Ok(Accepted::of(len, buf.len()))
    }

    pub(crate) fn post_recv(&self, len: usize, context: u64) -> Result<Accepted> {
        let mut st = self.lock();
        match st.endpoint {
            EndpointState::Enabled | EndpointState::Connecting | EndpointState::Connected => {}
            state => {
                return Err(TransportError::InvalidState {
                    op: "recv",
                    state,
                    required: "enabled",
                })
            }
        }
        if st.posted.len() >= st.attr.rx_size {
            return Err(TransportError::Again { op: "recv" });
        }
        let accepted = len.min(st.attr.max_msg_size);
        let recv = PostedRecv {
            context,
            len: accepted,
        };
        match st.unexpected.pop_front() {
            Some((seq, payload)) => st.deliver(recv, seq, payload),
            None => st.posted.push_back(recv),
        }
        trace!(endpoint = %self.id, len = accepted, "receive posted");
        Ok(Accepted::of(accepted, len))
    }

    /// Start the active side of the handshake on a background thread.
    pub(crate) fn connect(
        self: &Arc<Self>,
        dest: SocketAddrV4,
        request: ConnectRequest,
    ) -> Result<JoinHandle<()>> {
        {
            let mut st = self.lock();
            if st.endpoint != EndpointState::Enabled {
                return Err(TransportError::InvalidState {
                    op: "connect",
                    state: st.endpoint,
                    required: "enabled",
                });
            }
            st.endpoint = EndpointState::Connecting;
            st.peer = Some(dest);
        }
        let link = Arc::clone(self);
        thread::Builder::new()
            .name(format!("fabex-connect-{}", self.id))
            .spawn(move || {
                if let Err((errno, detail)) = link.handshake(dest, request) {
                    link.connect_failed(errno, detail);
                }
            })
            .map_err(|err| TransportError::io("connect", err))
    }

    fn handshake(self: &Arc<Self>, dest: SocketAddrV4, request: ConnectRequest) -> HandshakeResult<()> {
        let stream = TcpStream::connect_timeout(&SocketAddr::V4(dest), HANDSHAKE_TIMEOUT)
            .map_err(io_failure)?;
        {
            let mut st = self.lock();
            if st.endpoint == EndpointState::Closed {
                return Err((Errno::Canceled, "endpoint closed".to_string()));
            }
            st.socket = Some(stream.try_clone().map_err(io_failure)?);
        }
        stream.set_nodelay(true).map_err(io_failure)?;
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(io_failure)?;

        FrameWriter::new(&stream)
            .write_message(WireMessage::ConnReq(request))
            .map_err(|err| transport_failure(err.into()))?;
        let mut reader = FrameReader::new(stream.try_clone().map_err(io_failure)?);
        let response = match reader.read_message() {
            Ok(WireMessage::ConnResp(response)) => response,
            Ok(other) => {
                return Err((
                    Errno::Proto,
                    format!("expected CONN_RESP, got {}", other.kind()),
                ))
            }
            Err(err) => return Err(transport_failure(err.into())),
        };
        if !response.accepted {
            let reason = response
                .reason
                .unwrap_or_else(|| "connection rejected".to_string());
            return Err((Errno::ConnRefused, reason));
        }
        stream.set_read_timeout(None).map_err(io_failure)?;
        self.start_io(reader, stream, response.max_msg_size)
            .map_err(transport_failure)
    }

    fn connect_failed(&self, errno: Errno, detail: String) {
        let mut st = self.lock();
        if st.endpoint == EndpointState::Closed {
            debug!(endpoint = %self.id, "connect abandoned; endpoint closed");
            return;
        }
        warn!(endpoint = %self.id, error = %errno, detail = %detail, "connect failed");
        st.endpoint = EndpointState::Enabled;
        if let Some(socket) = st.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        if let Some(eq) = &st.eq {
            eq.post_error(EqErrEntry::new(Some(self.id), errno, detail.into_bytes()));
        }
    }

    /// Answer a pending connection request and start the data path.
    pub(crate) fn accept(self: &Arc<Self>, pending: &PendingConnection) -> Result<()> {
        let max_msg_size = {
            let mut st = self.lock();
            if st.endpoint != EndpointState::Enabled {
                return Err(TransportError::InvalidState {
                    op: "accept",
                    state: st.endpoint,
                    required: "enabled",
                });
            }
            st.peer = Some(pending.peer());
            st.attr.max_msg_size
        };
        let Handshake { reader, stream } = pending.take("accept")?;
        FrameWriter::new(&stream)
            .write_message(WireMessage::ConnResp(ConnectResponse::accept(max_msg_size)))?;
        self.start_io(reader, stream, max_msg_size)
    }

    fn start_io(
        self: &Arc<Self>,
        reader: FrameReader<TcpStream>,
        stream: TcpStream,
        max_msg_size: usize,
    ) -> Result<()> {
        let writer = FrameWriter::new(
            stream
                .try_clone()
                .map_err(|err| TransportError::io("start", err))?,
        );
        let (outbound, queued) = mpsc::channel();
        let eq = {
            let mut st = self.lock();
            if st.endpoint == EndpointState::Closed {
                return Err(TransportError::Closed {
                    op: "start",
                    object: FidKind::ActiveEndpoint,
                });
            }
            st.attr.max_msg_size = st.attr.max_msg_size.min(max_msg_size);
            st.outbound = Some(outbound);
            st.socket = Some(stream);
            st.endpoint = EndpointState::Connected;
            st.eq.clone()
        };

        let link = Arc::clone(self);
        let writer_thread = thread::Builder::new()
            .name(format!("fabex-tx-{}", self.id))
            .spawn(move || link.write_loop(writer, queued))
            .map_err(|err| TransportError::io("start", err))?;
        let link = Arc::clone(self);
        let reader_thread = thread::Builder::new()
            .name(format!("fabex-rx-{}", self.id))
            .spawn(move || link.read_loop(reader))
            .map_err(|err| TransportError::io("start", err))?;
        {
            let mut threads = self
                .threads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            threads.writer = Some(writer_thread);
            threads.reader = Some(reader_thread);
        }

        info!(endpoint = %self.id, peer = ?self.peer(), max_msg_size = self.max_msg_size(), "connected");
        if let Some(eq) = eq {
            eq.post_event(EqEvent::Connected { fid: self.id });
        }
        Ok(())
    }

    fn write_loop(&self, mut writer: FrameWriter<TcpStream>, queued: Receiver<WireMessage>) {
        for message in queued {
            let last = matches!(message, WireMessage::Shutdown);
            if let Err(err) = writer.write_message(message) {
                let err = TransportError::from(err);
                self.on_failure(err.errno(), err.to_string());
                return;
            }
            if last {
                break;
            }
        }
        trace!(endpoint = %self.id, "writer finished");
    }

    fn read_loop(&self, mut reader: FrameReader<TcpStream>) {
        loop {
            match reader.read_message() {
                Ok(WireMessage::Data { seq, payload }) => self.on_data(seq, payload),
                Ok(WireMessage::Ack { seq }) => self.on_ack(seq),
                Ok(WireMessage::Shutdown) => {
                    self.on_peer_shutdown();
                    return;
                }
                Ok(other) => {
                    self.on_failure(
                        Errno::Proto,
                        format!("unexpected {} on a connected link", other.kind()),
                    );
                    return;
                }
                Err(err) => {
                    let err = TransportError::from(err);
                    self.on_failure(err.errno(), err.to_string());
                    return;
                }
            }
        }
    }

    fn on_data(&self, seq: u64, payload: Bytes) {
        let mut st = self.lock();
        if matches!(
            st.endpoint,
            EndpointState::ShuttingDown | EndpointState::Closed
        ) {
            debug!(endpoint = %self.id, seq, "data after shutdown dropped");
            return;
        }
        match st.posted.pop_front() {
            Some(recv) => st.deliver(recv, seq, payload),
            None => {
                trace!(endpoint = %self.id, seq, "no receive posted; queued as unexpected");
                st.unexpected.push_back((seq, payload));
            }
        }
    }

    fn on_ack(&self, seq: u64) {
        let mut st = self.lock();
        let Some(index) = st.inflight.iter().position(|send| send.seq == seq) else {
            warn!(endpoint = %self.id, seq, "acknowledgement for unknown send");
            return;
        };
        if index != 0 {
            warn!(endpoint = %self.id, seq, "acknowledgement out of order");
        }
        if let Some(send) = st.inflight.remove(index) {
            if let Some(tx) = &st.tx_cq {
                tx.complete(Completion {
                    context: send.context,
                    flags: CompletionFlags::SEND,
                    len: send.len,
                    data: None,
                    completed_at: Instant::now(),
                });
            }
        }
    }

    fn on_peer_shutdown(&self) {
        let mut st = self.lock();
        info!(endpoint = %self.id, "peer shut down");
        if st.endpoint == EndpointState::Connected {
            st.endpoint = EndpointState::ShuttingDown;
        }
        st.cancel_outstanding(Errno::Canceled);
        if let Some(eq) = &st.eq {
            eq.post_event(EqEvent::Shutdown { fid: self.id });
        }
    }

    fn on_failure(&self, errno: Errno, detail: String) {
        let mut st = self.lock();
        match st.endpoint {
            EndpointState::Connected | EndpointState::Connecting => {
                warn!(endpoint = %self.id, error = %errno, detail = %detail, "connection lost");
                st.endpoint = EndpointState::ShuttingDown;
                st.cancel_outstanding(Errno::ConnReset);
                if let Some(eq) = &st.eq {
                    eq.post_error(EqErrEntry::new(Some(self.id), errno, detail.into_bytes()));
                }
            }
            _ => {
                debug!(endpoint = %self.id, error = %errno, "link closed");
                st.cancel_outstanding(Errno::ConnReset);
            }
        }
    }

    /// Send SHUTDOWN to the peer and cancel outstanding operations.
    pub(crate) fn shutdown(&self) -> Result<()> {
        let mut st = self.lock();
        if st.shutdown_sent || st.endpoint == EndpointState::Closed {
            return Ok(());
        }
        match st.endpoint {
            EndpointState::Connected | EndpointState::ShuttingDown => {}
            state => {
                return Err(TransportError::InvalidState {
                    op: "shutdown",
                    state,
                    required: "connected",
                })
            }
        }
        st.shutdown_sent = true;
        st.endpoint = EndpointState::ShuttingDown;
        if st.enqueue(WireMessage::Shutdown).is_err() {
            debug!(endpoint = %self.id, "shutdown not sent; writer gone");
        }
        st.cancel_outstanding(Errno::Canceled);
        info!(endpoint = %self.id, "shutdown");
        Ok(())
    }

    /// Stop the provider threads and release the socket.
    pub(crate) fn close(&self, connector: Option<JoinHandle<()>>) {
        let (outbound, socket) = {
            let mut st = self.lock();
            if st.endpoint == EndpointState::Closed {
                return;
            }
            st.endpoint = EndpointState::Closed;
            st.cancel_outstanding(Errno::Canceled);
            (st.outbound.take(), st.socket.take())
        };
        let threads = std::mem::take(
            &mut *self
                .threads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        // The writer drains what is already queued once the channel closes.
        drop(outbound);
        if let Some(writer) = threads.writer {
            let _ = writer.join();
        }
        if let Some(socket) = socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
        if let Some(reader) = threads.reader {
            let _ = reader.join();
        }
        if let Some(connector) = connector {
            let _ = connector.join();
        }
        debug!(endpoint = %self.id, "link closed");
    }
}

fn require_unenabled(st: &LinkState, op: &'static str) -> Result<()> {
    match st.endpoint {
        EndpointState::Created | EndpointState::Bound => Ok(()),
        state => Err(TransportError::InvalidState {
            op,
            state,
            required: "created or bound",
        }),
    }
}

/// What a passive endpoint offers to incoming connection requests.
#[derive(Debug, Clone)]
pub(crate) struct ListenOffer {
    pub(crate) provider: &'static str,
    pub(crate) fabric_name: String,
    pub(crate) domain_name: String,
    pub(crate) ep_attr: EpAttr,
}

/// Background accept loop of a listening passive endpoint.
pub(crate) struct ListenerTask {
    local: SocketAddrV4,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerTask {
    pub(crate) fn start(addr: SocketAddrV4, offer: ListenOffer, eq: EqSink) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|err| TransportError::io("listen", err))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| TransportError::io("listen", err))?;
        let local = match listener
            .local_addr()
            .map_err(|err| TransportError::io("listen", err))?
        {
            SocketAddr::V4(local) => local,
            SocketAddr::V6(_) => {
                return Err(TransportError::Fatal {
                    op: "listen",
                    errno: Errno::InvalidArg,
                })
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("fabex-listen".to_string())
            .spawn(move || accept_loop(listener, local, offer, eq, flag))
            .map_err(|err| TransportError::io("listen", err))?;
        info!(addr = %local, "listening");
        Ok(Self {
            local,
            stop,
            thread: Some(thread),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!(addr = %self.local, "listener stopped");
        }
    }
}

impl Drop for ListenerTask {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    local: SocketAddrV4,
    offer: ListenOffer,
    eq: EqSink,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = receive_request(stream, peer, local, &offer, &eq) {
                    warn!(%peer, error = %err, "connection request dropped");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn receive_request(
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddrV4,
    offer: &ListenOffer,
    eq: &EqSink,
) -> Result<()> {
    let io = |err| TransportError::io("listen", err);
    stream.set_nonblocking(false).map_err(io)?;
    stream.set_nodelay(true).map_err(io)?;
    stream
        .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
        .map_err(io)?;
    let SocketAddr::V4(peer) = peer else {
        return Err(TransportError::Fatal {
            op: "listen",
            errno: Errno::InvalidArg,
        });
    };

    let mut reader = FrameReader::new(stream.try_clone().map_err(io)?);
    let request = match reader.read_message()? {
        WireMessage::ConnReq(request) => request,
        other => {
            warn!(%peer, kind = %other.kind(), "expected CONN_REQ");
            return Err(TransportError::Fatal {
                op: "listen",
                errno: Errno::Proto,
            });
        }
    };
    stream.set_read_timeout(None).map_err(io)?;

    let ep_type = EpType::from_name(&request.ep_type);
    let refusal = if request.protocol != PROTOCOL_NAME {
        Some(format!("unsupported protocol {}", request.protocol))
    } else if ep_type.is_none() {
        Some(format!("unsupported endpoint type {}", request.ep_type))
    } else if request.max_msg_size == 0 {
        Some("zero message size".to_string())
    } else {
        None
    };
    let pending = Arc::new(PendingConnection::new(reader, stream, peer));
    if let Some(reason) = refusal {
        pending.reject(&reason)?;
        return Err(TransportError::Fatal {
            op: "listen",
            errno: Errno::Proto,
        });
    }

    let info = Info {
        provider: offer.provider,
        fabric_name: offer.fabric_name.clone(),
        domain_name: offer.domain_name.clone(),
        caps: Capabilities::from_bits_truncate(request.caps),
        ep_type: ep_type.unwrap_or(EpType::Msg),
        ep_attr: EpAttr {
            max_msg_size: offer.ep_attr.max_msg_size.min(request.max_msg_size),
            ..offer.ep_attr
        },
        src_addr: Some(local),
        dest_addr: Some(peer),
        pending: Some(pending),
        fid: Fid::new(FidKind::Info),
    };
    info!(%peer, caps = ?info.caps, max_msg_size = info.ep_attr.max_msg_size, "connection request");
    eq.post_event(EqEvent::ConnReq(ConnectionRequest::new(info)));
    Ok(())
}
