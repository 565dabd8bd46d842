//! Dependency tracking between fabric objects.
//!
//! Every object owns one [`Fid`]. Opening an object on another, or binding
//! it to another, pins the target: the target counts one more dependent and
//! refuses to close until that dependent has closed. This turns the
//! transport's teardown order (endpoint → queues → domain → event queue →
//! fabric → info) into a checked property instead of undefined behaviour.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{Result, TransportError};

/// What kind of object a fid belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FidKind {
    Info,
    Fabric,
    EventQueue,
    Domain,
    CompletionQueue,
    PassiveEndpoint,
    ActiveEndpoint,
}

impl fmt::Display for FidKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FidKind::Info => "info",
            FidKind::Fabric => "fabric",
            FidKind::EventQueue => "event queue",
            FidKind::Domain => "domain",
            FidKind::CompletionQueue => "completion queue",
            FidKind::PassiveEndpoint => "passive endpoint",
            FidKind::ActiveEndpoint => "active endpoint",
        };
        f.write_str(name)
    }
}

struct Node {
    kind: FidKind,
    dependents: AtomicUsize,
    closed: AtomicBool,
    pins: Mutex<Vec<Arc<Node>>>,
}

/// Handle identity of one fabric object.
pub(crate) struct Fid {
    node: Arc<Node>,
}

impl Fid {
    pub(crate) fn new(kind: FidKind) -> Self {
        Self {
            node: Arc::new(Node {
                kind,
                dependents: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                pins: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open a new object on top of `parents`.
    pub(crate) fn child(kind: FidKind, op: &'static str, parents: &[&Fid]) -> Result<Self> {
        let fid = Self::new(kind);
        for parent in parents {
            fid.pin(op, parent)?;
        }
        Ok(fid)
    }

    pub(crate) fn kind(&self) -> FidKind {
        self.node.kind
    }

    /// Record that this object depends on `target`.
    pub(crate) fn pin(&self, op: &'static str, target: &Fid) -> Result<()> {
        target.ensure_open(op)?;
        self.ensure_open(op)?;
        target.node.dependents.fetch_add(1, Ordering::SeqCst);
        self.node
            .pins
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::clone(&target.node));
        Ok(())
    }

    pub(crate) fn ensure_open(&self, op: &'static str) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed {
                op,
                object: self.node.kind,
            });
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.node.closed.load(Ordering::SeqCst)
    }

    /// Number of open objects depending on this one.
    pub(crate) fn dependents(&self) -> usize {
        self.node.dependents.load(Ordering::SeqCst)
    }

    /// Close the object, releasing everything it pinned.
    ///
    /// Closing twice is a no-op.
    pub(crate) fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let open = self.dependents();
        if open > 0 {
            return Err(TransportError::TeardownOrderViolation {
                object: self.node.kind,
                open,
            });
        }
        self.node.closed.store(true, Ordering::SeqCst);
        let pins = std::mem::take(
            &mut *self
                .node
                .pins
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for pinned in pins {
            pinned.dependents.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(object = %self.kind(), "closed");
        Ok(())
    }
}

impl Drop for Fid {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(
                object = %self.kind(),
                error = %err,
                "object dropped out of teardown order; left open"
            );
        }
    }
}

impl fmt::Debug for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fid")
            .field("kind", &self.kind())
            .field("dependents", &self.dependents())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_refuses_close_while_child_open() {
        let parent = Fid::new(FidKind::Domain);
        let child = Fid::child(FidKind::CompletionQueue, "cq_open", &[&parent]).unwrap();
        assert_eq!(child.kind(), FidKind::CompletionQueue);

        let err = parent.close().unwrap_err();
        assert!(matches!(
            err,
            TransportError::TeardownOrderViolation {
                object: FidKind::Domain,
                open: 1
            }
        ));
        assert!(!parent.is_closed());

        child.close().unwrap();
        parent.close().unwrap();
        assert!(parent.is_closed());
    }

    #[test]
    fn close_is_idempotent() {
        let fid = Fid::new(FidKind::Info);
        fid.close().unwrap();
        fid.close().unwrap();
    }

    #[test]
    fn cannot_pin_closed_target() {
        let target = Fid::new(FidKind::EventQueue);
        target.close().unwrap();
        let fid = Fid::new(FidKind::PassiveEndpoint);
        let err = fid.pin("pep_bind", &target).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Closed {
                object: FidKind::EventQueue,
                ..
            }
        ));
    }

    #[test]
    fn dropping_child_releases_parent() {
        let parent = Fid::new(FidKind::Fabric);
        {
            let _child = Fid::child(FidKind::EventQueue, "eq_open", &[&parent]).unwrap();
            assert_eq!(parent.dependents(), 1);
        }
        assert_eq!(parent.dependents(), 0);
        parent.close().unwrap();
    }
}
