//! Event queues and completion queues.
//!
//! Both are blocking FIFOs filled by the provider threads and drained by the
//! owning thread. A read that finds an error record at the head reports
//! [`TransportError::ErrorAvailable`] and leaves the record for `readerr`.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use bytes::Bytes;
use tracing::warn;

use crate::endpoint::{ConnectionRequest, EndpointId};
use crate::error::{Errno, Result, TransportError};
use crate::fabric::{Domain, Fabric};
use crate::fid::{Fid, FidKind};

pub(crate) struct WaitQueue<T> {
    entries: Mutex<VecDeque<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T> WaitQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry. Returns false when the queue was already at capacity;
    /// the entry is kept regardless so no completion is ever lost.
    pub(crate) fn push(&self, entry: T) -> bool {
        let mut entries = self.lock();
        let within = entries.len() < self.capacity;
        entries.push_back(entry);
        drop(entries);
        self.ready.notify_all();
        within
    }

    /// Wait until an entry is present (or the timeout expires) and run `f`
    /// on the queue. `None` means the wait timed out.
    fn with_front<R>(
        &self,
        timeout: Option<Duration>,
        f: impl FnOnce(&mut VecDeque<T>) -> R,
    ) -> Option<R> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut entries = self.lock();
        while entries.is_empty() {
            match deadline {
                None => {
                    entries = self
                        .ready
                        .wait(entries)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    entries = self
                        .ready
                        .wait_timeout(entries, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
            }
        }
        Some(f(&mut entries))
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Connection-management event.
#[derive(Debug)]
pub enum EqEvent {
    /// A peer asked to connect to a listening passive endpoint.
    ConnReq(ConnectionRequest),
    /// The endpoint finished connecting.
    Connected { fid: EndpointId },
    /// The peer shut the connection down.
    Shutdown { fid: EndpointId },
}

impl EqEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EqEvent::ConnReq(_) => "CONNREQ",
            EqEvent::Connected { .. } => "CONNECTED",
            EqEvent::Shutdown { .. } => "SHUTDOWN",
        }
    }
}

/// Error record read from an event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqErrEntry {
    /// Endpoint the error belongs to, when known.
    pub fid: Option<EndpointId>,
    pub err: Errno,
    /// Provider-specific detail code (negated errno of the underlying call).
    pub prov_errno: i32,
    /// Provider-supplied error data, e.g. a reject reason.
    pub err_data: Vec<u8>,
}

impl EqErrEntry {
    pub(crate) fn new(fid: Option<EndpointId>, err: Errno, err_data: impl Into<Vec<u8>>) -> Self {
        Self {
            fid,
            err,
            prov_errno: err.status(),
            err_data: err_data.into(),
        }
    }

    pub fn err_data_size(&self) -> usize {
        self.err_data.len()
    }
}

pub(crate) enum EqEntry {
    Event(EqEvent),
    Error(EqErrEntry),
}

pub(crate) type EqSink = Arc<WaitQueue<EqEntry>>;

impl WaitQueue<EqEntry> {
    pub(crate) fn post_event(&self, event: EqEvent) {
        let name = event.name();
        if !self.push(EqEntry::Event(event)) {
            warn!(event = name, "event queue overrun");
        }
    }

    pub(crate) fn post_error(&self, entry: EqErrEntry) {
        let err = entry.err;
        if !self.push(EqEntry::Error(entry)) {
            warn!(error = %err, "event queue overrun");
        }
    }
}

/// Event queue attributes.
#[derive(Debug, Clone, Copy)]
pub struct EqAttr {
    /// Entries the queue is sized for.
    pub size: usize,
}

impl Default for EqAttr {
    fn default() -> Self {
        Self { size: 10 }
    }
}

/// Queue of connection-management events.
pub struct EventQueue {
    queue: EqSink,
    fid: Fid,
}

impl EventQueue {
    /// Open an event queue on a fabric.
    pub fn open(fabric: &Fabric, attr: EqAttr) -> Result<Self> {
        let fid = Fid::child(FidKind::EventQueue, "eq_open", &[fabric.fid()])?;
        Ok(Self {
            queue: Arc::new(WaitQueue::new(attr.size)),
            fid,
        })
    }

    /// Blocking read of the next event. `None` waits indefinitely; an
    /// expired timeout reports `Again`.
    pub fn sread(&self, timeout: Option<Duration>) -> Result<EqEvent> {
        self.fid.ensure_open("eq_sread")?;
        let read = self.queue.with_front(timeout, |entries| {
            if matches!(entries.front(), Some(EqEntry::Error(_))) {
                return Err(TransportError::ErrorAvailable { op: "eq_sread" });
            }
            match entries.pop_front() {
                Some(EqEntry::Event(event)) => Ok(event),
                _ => Err(TransportError::Again { op: "eq_sread" }),
            }
        });
        read.unwrap_or(Err(TransportError::Again { op: "eq_sread" }))
    }

    /// Pop the error record at the head of the queue.
    pub fn readerr(&self) -> Result<EqErrEntry> {
        self.fid.ensure_open("eq_readerr")?;
        let read = self.queue.with_front(Some(Duration::ZERO), |entries| {
            match entries.front() {
                Some(EqEntry::Error(_)) => match entries.pop_front() {
                    Some(EqEntry::Error(entry)) => Some(entry),
                    _ => None,
                },
                _ => None,
            }
        });
        read.flatten().ok_or(TransportError::Again { op: "eq_readerr" })
    }

    /// Entries waiting to be read.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Close the queue. Fails while endpoints are bound to it.
    pub fn close(&mut self) -> Result<()> {
        self.fid.close()
    }

    pub(crate) fn sink(&self) -> EqSink {
        Arc::clone(&self.queue)
    }

    pub(crate) fn fid(&self) -> &Fid {
        &self.fid
    }
}

bitflags! {
    /// What kind of operation a completion reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CompletionFlags: u64 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
    }
}

/// Successful completion of a posted operation.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Caller-supplied context of the post.
    pub context: u64,
    pub flags: CompletionFlags,
    /// Bytes moved.
    pub len: usize,
    /// Received bytes (receive completions only).
    pub data: Option<Bytes>,
    /// When the provider generated the completion.
    pub completed_at: Instant,
}

/// Error completion of a posted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqErrEntry {
    pub context: u64,
    pub flags: CompletionFlags,
    pub err: Errno,
    /// Bytes the failed operation covered.
    pub len: usize,
}

pub(crate) type CqEntry = std::result::Result<Completion, CqErrEntry>;
pub(crate) type CqSink = Arc<WaitQueue<CqEntry>>;

impl WaitQueue<CqEntry> {
    pub(crate) fn complete(&self, completion: Completion) {
        if !self.push(Ok(completion)) {
            warn!("completion queue overrun");
        }
    }

    pub(crate) fn fail(&self, entry: CqErrEntry) {
        if !self.push(Err(entry)) {
            warn!("completion queue overrun");
        }
    }
}

/// Completion queue attributes.
#[derive(Debug, Clone, Copy)]
pub struct CqAttr {
    /// Entries the queue is sized for.
    pub size: usize,
}

impl Default for CqAttr {
    fn default() -> Self {
        Self { size: 128 }
    }
}

/// Queue of completed sends or receives.
pub struct CompletionQueue {
    queue: CqSink,
    fid: Fid,
}

impl CompletionQueue {
    /// Open a completion queue on a domain.
    pub fn open(domain: &Domain, attr: CqAttr) -> Result<Self> {
        let fid = Fid::child(FidKind::CompletionQueue, "cq_open", &[domain.fid()])?;
        Ok(Self {
            queue: Arc::new(WaitQueue::new(attr.size)),
            fid,
        })
    }

    /// Blocking read of one completion. `None` waits indefinitely; an
    /// expired timeout reports `Again`.
    pub fn sread(&self, timeout: Option<Duration>) -> Result<Completion> {
        self.fid.ensure_open("cq_sread")?;
        let read = self.queue.with_front(timeout, |entries| {
            if matches!(entries.front(), Some(Err(_))) {
                return Err(TransportError::ErrorAvailable { op: "cq_sread" });
            }
            match entries.pop_front() {
                Some(Ok(completion)) => Ok(completion),
                _ => Err(TransportError::Again { op: "cq_sread" }),
            }
        });
        read.unwrap_or(Err(TransportError::Again { op: "cq_sread" }))
    }

    /// Non-blocking read; `Again` when nothing has completed.
    pub fn read(&self) -> Result<Completion> {
        self.sread(Some(Duration::ZERO))
    }

    /// Pop the error completion at the head of the queue.
    pub fn readerr(&self) -> Result<CqErrEntry> {
        self.fid.ensure_open("cq_readerr")?;
        let read = self
            .queue
            .with_front(Some(Duration::ZERO), |entries| match entries.front() {
                Some(Err(_)) => entries.pop_front().and_then(|entry| entry.err()),
                _ => None,
            });
        read.flatten().ok_or(TransportError::Again { op: "cq_readerr" })
    }

    /// Entries waiting to be read.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Close the queue. Fails while an endpoint is bound to it.
    pub fn close(&mut self) -> Result<()> {
        self.fid.close()
    }

    pub(crate) fn sink(&self) -> CqSink {
        Arc::clone(&self.queue)
    }

    pub(crate) fn fid(&self) -> &Fid {
        &self.fid
    }
}
