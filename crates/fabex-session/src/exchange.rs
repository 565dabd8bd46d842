//! Message exchange engine.
//!
//! Turns the transport's post-then-complete primitives into blocking
//! scalar and buffer transfers. Buffers larger than one message are posted
//! in chunks: a partial accept advances the cursor, a busy transport is
//! resolved by draining one completion and retrying, and the transfer ends
//! once every posted chunk has completed. Completions are checked against
//! the order their posts were made in.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use fabex_transport::{
    Accepted, ActiveEndpoint, BindFlags, Completion, CqAttr, Domain, EventQueue, Info,
    TransportError,
};
use serde::Serialize;
use tracing::{debug, trace};

use crate::context::CompletionQueuePair;
use crate::error::{Result, SessionError};

type TransportResult<T> = fabex_transport::Result<T>;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    pub(crate) fn op(self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Recv => "recv",
        }
    }

    fn index(self) -> usize {
        match self {
            Direction::Send => 0,
            Direction::Recv => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op())
    }
}

/// The transport operations the engine needs.
pub trait MsgEndpoint {
    /// Post a send of `buf`; may accept only a prefix.
    fn post_send(&mut self, buf: &[u8], context: u64) -> TransportResult<Accepted>;

    /// Post a receive of up to `len` bytes; may accept only a prefix.
    fn post_recv(&mut self, len: usize, context: u64) -> TransportResult<Accepted>;

    /// Block for the next completion of `direction`. An error completion is
    /// reported as [`TransportError::Completion`].
    fn read_completion(
        &mut self,
        direction: Direction,
        timeout: Option<Duration>,
    ) -> TransportResult<Completion>;
}

/// An active endpoint with its completion queues.
pub struct FabricEndpoint {
    pub endpoint: ActiveEndpoint,
    pub cqs: CompletionQueuePair,
}

impl FabricEndpoint {
    /// Open an endpoint on `domain`, bind it to a fresh completion queue
    /// pair and `eq`, and enable it.
    pub fn open(domain: &Domain, eq: &EventQueue, info: &Info, cq_attr: CqAttr) -> Result<Self> {
        let cqs = CompletionQueuePair::open(domain, cq_attr)?;
        let mut endpoint = ActiveEndpoint::open(domain, info)?;
        endpoint.bind_cq(&cqs.tx, BindFlags::TRANSMIT)?;
        endpoint.bind_cq(&cqs.rx, BindFlags::RECV)?;
        endpoint.bind_eq(eq)?;
        endpoint.enable()?;
        Ok(Self { endpoint, cqs })
    }

    /// Close the endpoint, then its queues.
    pub fn close(&mut self) -> Result<()> {
        self.endpoint.close()?;
        self.cqs.close()
    }
}

impl MsgEndpoint for FabricEndpoint {
    fn post_send(&mut self, buf: &[u8], context: u64) -> TransportResult<Accepted> {
        self.endpoint.send(buf, context)
    }

    fn post_recv(&mut self, len: usize, context: u64) -> TransportResult<Accepted> {
        self.endpoint.recv(len, context)
    }

    fn read_completion(
        &mut self,
        direction: Direction,
        timeout: Option<Duration>,
    ) -> TransportResult<Completion> {
        let cq = match direction {
            Direction::Send => &self.cqs.tx,
            Direction::Recv => &self.cqs.rx,
        };
        match cq.sread(timeout) {
            Err(TransportError::ErrorAvailable { .. }) => {
                Err(TransportError::Completion(cq.readerr()?))
            }
            other => other,
        }
    }
}

/// Fixed-width values sent as one message.
pub trait WireScalar: Sized + Copy {
    const WIDTH: usize;

    fn to_wire(self) -> Vec<u8>;

    fn from_wire(bytes: &[u8]) -> Option<Self>;
}

impl WireScalar for f32 {
    const WIDTH: usize = 4;

    fn to_wire(self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }

    fn from_wire(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(f32::from_le_bytes)
    }
}

impl WireScalar for usize {
    const WIDTH: usize = std::mem::size_of::<usize>();

    fn to_wire(self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }

    fn from_wire(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(usize::from_le_bytes)
    }
}

/// A posted receive that has not been completed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a posted receive must be completed"]
pub struct PendingRecv {
    context: u64,
    len: usize,
}

impl PendingRecv {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Outcome of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub direction: Direction,
    pub bytes: usize,
    /// Posts that made up the transfer.
    pub chunks: usize,
    /// Times the transport reported busy and a completion was drained.
    pub busy_retries: usize,
}

impl TransferReport {
    fn new(direction: Direction, bytes: usize) -> Self {
        Self {
            direction,
            bytes,
            chunks: 0,
            busy_retries: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Posted {
    context: u64,
    len: usize,
}

enum Payload<'a> {
    Outgoing(&'a [u8]),
    Incoming(&'a mut [u8]),
}

impl Payload<'_> {
    fn direction(&self) -> Direction {
        match self {
            Payload::Outgoing(_) => Direction::Send,
            Payload::Incoming(_) => Direction::Recv,
        }
    }

    fn len(&self) -> usize {
        match self {
            Payload::Outgoing(buf) => buf.len(),
            Payload::Incoming(buf) => buf.len(),
        }
    }
}

/// Blocking transfers over a [`MsgEndpoint`].
pub struct Exchange<E> {
    endpoint: E,
    next_context: u64,
    outstanding: [VecDeque<Posted>; 2],
    parked: HashMap<u64, Completion>,
}

impl<E: MsgEndpoint> Exchange<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            next_context: 1,
            outstanding: [VecDeque::new(), VecDeque::new()],
            parked: HashMap::new(),
        }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub fn endpoint_mut(&mut self) -> &mut E {
        &mut self.endpoint
    }

    pub fn into_inner(self) -> E {
        self.endpoint
    }

    /// Posts of `direction` that have not completed yet.
    pub fn outstanding(&self, direction: Direction) -> usize {
        self.outstanding[direction.index()].len()
    }

    fn context(&mut self) -> u64 {
        let context = self.next_context;
        self.next_context += 1;
        context
    }

    /// Read the next completion of `direction` and match it against the
    /// oldest outstanding post.
    fn reap(&mut self, direction: Direction) -> Result<(Posted, Completion)> {
        let completion = self.endpoint.read_completion(direction, None)?;
        let queue = &mut self.outstanding[direction.index()];
        let posted = queue.pop_front().ok_or_else(|| {
            SessionError::protocol(format!(
                "{direction} completion {} with nothing outstanding",
                completion.context
            ))
        })?;
        if completion.context != posted.context {
            return Err(SessionError::protocol(format!(
                "{direction} completion {} arrived while {} was oldest",
                completion.context, posted.context
            )));
        }
        if completion.len != posted.len {
            return Err(SessionError::protocol(format!(
                "{direction} completion {} moved {} of {} bytes",
                completion.context, completion.len, posted.len
            )));
        }
        Ok((posted, completion))
    }

    /// Post `payload` in as many chunks as the transport needs and wait for
    /// all of them.
    fn transfer(&mut self, mut payload: Payload<'_>) -> Result<TransferReport> {
        let direction = payload.direction();
        let total = payload.len();
        let mut report = TransferReport::new(direction, total);
        if total == 0 {
            return Ok(report);
        }

        let mut chunks: HashMap<u64, usize> = HashMap::new();
        let mut cursor = 0usize;
        while cursor < total {
            let remaining = total - cursor;
            let context = self.context();
            let posted = match &payload {
                Payload::Outgoing(buf) => self.endpoint.post_send(&buf[cursor..], context),
                Payload::Incoming(_) => self.endpoint.post_recv(remaining, context),
            };
            match posted {
                Ok(accepted) => {
                    let len = accepted.len(remaining);
                    if len == 0 {
                        return Err(SessionError::protocol(format!(
                            "{direction} post accepted no bytes"
                        )));
                    }
                    self.outstanding[direction.index()].push_back(Posted { context, len });
                    chunks.insert(context, cursor);
                    cursor += len;
                    report.chunks += 1;
                    trace!(%direction, context, offset = cursor - len, len, ?accepted, "chunk posted");
                }
                Err(err) if err.is_again() && self.outstanding(direction) > 0 => {
                    report.busy_retries += 1;
                    trace!(%direction, posted = cursor, total, "transport busy; draining");
                    self.drain_one(&mut payload, &mut chunks)
                        .map_err(|err| abort(direction, cursor, total, err))?;
                }
                Err(err) => {
                    return Err(abort(direction, cursor, total, SessionError::Transport(err)))
                }
            }
        }

        while !chunks.is_empty() {
            self.drain_chunk(&mut payload, &mut chunks)
                .map_err(|err| abort(direction, cursor, total, err))?;
        }
        debug!(
            %direction,
            bytes = report.bytes,
            chunks = report.chunks,
            busy_retries = report.busy_retries,
            "transfer complete"
        );
        Ok(report)
    }

    /// Reap completions until one of this transfer's chunks is reconciled.
    fn drain_chunk(
        &mut self,
        payload: &mut Payload<'_>,
        chunks: &mut HashMap<u64, usize>,
    ) -> Result<()> {
        while !self.drain_one(payload, chunks)? {}
        Ok(())
    }

    /// Reap one completion of the payload's direction. Receive data lands at
    /// the offset its chunk was posted for; completions of other posts are
    /// parked for whoever waits on them. Returns whether the completion was
    /// one of this transfer's chunks.
    fn drain_one(
        &mut self,
        payload: &mut Payload<'_>,
        chunks: &mut HashMap<u64, usize>,
    ) -> Result<bool> {
        let (posted, completion) = self.reap(payload.direction())?;
        let Some(offset) = chunks.remove(&posted.context) else {
            self.parked.insert(posted.context, completion);
            return Ok(false);
        };
        if let Payload::Incoming(buf) = payload {
            let data = completion
                .data
                .ok_or_else(|| SessionError::protocol("receive completion without data"))?;
            if data.len() != posted.len {
                return Err(SessionError::protocol(format!(
                    "receive completion carried {} of {} bytes",
                    data.len(),
                    posted.len
                )));
            }
            buf[offset..offset + posted.len].copy_from_slice(&data);
        }
        Ok(true)
    }

    /// Post a receive of `len` bytes to be completed later.
    pub fn post_recv(&mut self, len: usize) -> Result<PendingRecv> {
        let context = self.context();
        loop {
            match self.endpoint.post_recv(len, context) {
                Ok(Accepted::Full) => break,
                Ok(Accepted::Partial(n)) => {
                    return Err(SessionError::protocol(format!(
                        "receive of {len} bytes does not fit one message (limit {n})"
                    )))
                }
                Err(err) if err.is_again() && self.outstanding(Direction::Recv) > 0 => {
                    let (posted, completion) = self.reap(Direction::Recv)?;
                    self.parked.insert(posted.context, completion);
                }
                Err(err) => {
                    return Err(SessionError::TransferFailed {
                        direction: Direction::Recv,
                        source: err,
                    })
                }
            }
        }
        self.outstanding[Direction::Recv.index()].push_back(Posted { context, len });
        trace!(context, len, "receive posted");
        Ok(PendingRecv { context, len })
    }

    /// Post the receive for a scalar the peer sends later.
    pub fn post_scalar_recv<T: WireScalar>(&mut self) -> Result<PendingRecv> {
        self.post_recv(T::WIDTH)
    }

    /// Wait for a posted receive and return its bytes.
    pub fn complete_recv_bytes(&mut self, pending: PendingRecv) -> Result<Bytes> {
        let completion = loop {
            if let Some(completion) = self.parked.remove(&pending.context) {
                break completion;
            }
            let (posted, completion) = self.reap(Direction::Recv)?;
            if posted.context == pending.context {
                break completion;
            }
            self.parked.insert(posted.context, completion);
        };
        completion
            .data
            .ok_or_else(|| SessionError::protocol("receive completion without data"))
    }

    /// Wait for a posted scalar receive and decode it.
    pub fn complete_recv<T: WireScalar>(&mut self, pending: PendingRecv) -> Result<T> {
        let bytes = self.complete_recv_bytes(pending)?;
        T::from_wire(&bytes).ok_or_else(|| {
            SessionError::protocol(format!(
                "expected a {}-byte scalar, received {} bytes",
                T::WIDTH,
                bytes.len()
            ))
        })
    }

    /// Post and complete a scalar receive.
    pub fn recv_scalar<T: WireScalar>(&mut self) -> Result<T> {
        let pending = self.post_scalar_recv::<T>()?;
        self.complete_recv(pending)
    }

    /// Send one scalar and wait for its completion.
    pub fn send_scalar<T: WireScalar>(&mut self, value: T) -> Result<TransferReport> {
        let bytes = value.to_wire();
        let context = self.context();
        let mut report = TransferReport::new(Direction::Send, bytes.len());
        loop {
            match self.endpoint.post_send(&bytes, context) {
                Ok(Accepted::Full) => break,
                Ok(Accepted::Partial(n)) => {
                    return Err(SessionError::protocol(format!(
                        "{}-byte scalar does not fit one message (limit {n})",
                        bytes.len()
                    )))
                }
                Err(err) if err.is_again() && self.outstanding(Direction::Send) > 0 => {
                    report.busy_retries += 1;
                    self.reap(Direction::Send)?;
                }
                Err(err) => {
                    return Err(SessionError::TransferFailed {
                        direction: Direction::Send,
                        source: err,
                    })
                }
            }
        }
        report.chunks = 1;
        self.outstanding[Direction::Send.index()].push_back(Posted {
            context,
            len: bytes.len(),
        });
        loop {
            let (posted, _) = self.reap(Direction::Send)?;
            if posted.context == context {
                break;
            }
        }
        trace!(context, len = bytes.len(), "scalar sent");
        Ok(report)
    }

    /// Send a buffer, chunked as the transport requires.
    pub fn send_buffer(&mut self, bytes: &[u8]) -> Result<TransferReport> {
        self.transfer(Payload::Outgoing(bytes))
    }

    /// Receive exactly `len` bytes, chunked the same way the peer sent them.
    pub fn recv_buffer(&mut self, len: usize) -> Result<(Vec<u8>, TransferReport)> {
        let mut buf = vec![0u8; len];
        let report = self.transfer(Payload::Incoming(&mut buf))?;
        Ok((buf, report))
    }

    /// Send an element count followed by the elements.
    pub fn send_floats(&mut self, values: &[f32]) -> Result<TransferReport> {
        self.send_scalar(values.len())?;
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.send_buffer(&bytes)
    }

    /// Receive an element count followed by the elements. Counts above
    /// `max_elements` are refused before anything is allocated.
    pub fn recv_floats(&mut self, max_elements: usize) -> Result<(Vec<f32>, TransferReport)> {
        let count: usize = self.recv_scalar()?;
        if count > max_elements {
            return Err(SessionError::protocol(format!(
                "peer declared {count} elements, limit is {max_elements}"
            )));
        }
        let len = count.checked_mul(f32::WIDTH).ok_or_else(|| {
            SessionError::protocol(format!("element count {count} overflows"))
        })?;
        let (bytes, report) = self.recv_buffer(len)?;
        let values = bytes
            .chunks_exact(f32::WIDTH)
            .filter_map(f32::from_wire)
            .collect();
        Ok((values, report))
    }
}

fn abort(direction: Direction, posted: usize, total: usize, err: SessionError) -> SessionError {
    let source = match err {
        SessionError::Transport(source) => source,
        other => return other,
    };
    if posted == 0 {
        SessionError::TransferFailed { direction, source }
    } else {
        SessionError::PartialTransferAborted {
            direction,
            posted,
            total,
            source,
        }
    }
}
