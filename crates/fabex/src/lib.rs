//! Connection-oriented message exchange over a fabric-style transport.
//!
//! # Crate Structure
//!
//! - [`wire`] - Frame codec and the provider's connection messages
//! - [`transport`] - Fabric objects, queues and endpoints with a TCP provider
//! - [`session`] - Client/server sessions and the chunked exchange engine
//!   (behind `session` feature)

/// Re-export wire types.
pub mod wire {
    pub use fabex_wire::*;
}

/// Re-export transport types.
pub mod transport {
    pub use fabex_transport::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use fabex_session::*;
}
