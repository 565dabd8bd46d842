//! Framed wire protocol spoken between two fabex tcp endpoints.
//!
//! Each frame is an 8-byte header (magic "FX", header version, kind,
//! little-endian payload length) followed by the payload. Application
//! data never sees these frames; they carry connection management, data
//! messages and delivery acknowledgements underneath the fabric API.

pub mod codec;
pub mod error;
pub mod kind;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{Frame, FrameConfig, FrameHeader, DEFAULT_MAX_PAYLOAD, FRAME_VERSION, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use kind::FrameKind;
pub use message::{ConnectRequest, ConnectResponse, WireMessage, PROTOCOL_NAME, PROTOCOL_VERSION};
pub use reader::FrameReader;
pub use writer::FrameWriter;
