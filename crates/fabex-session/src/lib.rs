//! Client/server sessions over the fabex transport.
//!
//! Connect or listen, exchange scalars and chunked arrays, tear down in
//! dependency order. [`run_client`] and [`run_server`] drive the complete
//! exchange; [`Exchange`] is the transfer engine underneath.

pub mod config;
pub mod connector;
pub mod context;
pub mod error;
pub mod exchange;
pub mod listener;
pub mod protocol;

pub use config::{CommMode, SessionConfig, DEFAULT_PORT};
pub use connector::{ClientSession, ClientState};
pub use context::{CompletionQueuePair, FabricContext, Role};
pub use error::{Result, SessionError};
pub use exchange::{
    Direction, Exchange, FabricEndpoint, MsgEndpoint, PendingRecv, TransferReport, WireScalar,
};
pub use listener::{Listener, ServerSession, ServerState};
pub use protocol::{run_client, run_server, DemoConfig, DemoReport, DEFAULT_MAX_ELEMENTS};
