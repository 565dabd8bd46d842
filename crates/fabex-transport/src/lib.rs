//! Fabric object model with a socket-backed provider.
//!
//! Mirrors the shape of a reliable-connection fabric API:
//! - [`getinfo`] resolves requested capabilities against the providers
//!   compiled into this crate and returns an [`Info`] descriptor
//! - [`Fabric`], [`Domain`], [`EventQueue`] and [`CompletionQueue`] are the
//!   resources endpoints are built from
//! - [`PassiveEndpoint`] listens and produces connection requests,
//!   [`ActiveEndpoint`] posts sends/receives whose results show up as
//!   completions
//!
//! Every object records what it was opened on or bound to, and refuses to
//! close while anything still depends on it.

pub mod caps;
pub mod endpoint;
pub mod error;
pub mod fabric;
pub mod fid;
pub mod provider;
pub mod queue;

mod tcp;

pub use caps::{Capabilities, EpAttr, EpType, Hints, Info};
pub use endpoint::{
    Accepted, ActiveEndpoint, BindFlags, ConnectionRequest, EndpointId, EndpointState,
    PassiveEndpoint,
};
pub use error::{Errno, Result, TransportError};
pub use fabric::{Domain, Fabric};
pub use fid::FidKind;
pub use provider::{
    getinfo, providers, GetInfoFlags, ProviderDescriptor, MAX_MSG_SIZE, PROVIDER_TCP,
};
pub use queue::{
    Completion, CompletionFlags, CompletionQueue, CqAttr, CqErrEntry, EqAttr, EqErrEntry, EqEvent,
    EventQueue,
};
