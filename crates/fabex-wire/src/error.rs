/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header does not start with "FX".
    #[error("invalid frame magic {0:02x?} (expected \"FX\")")]
    InvalidMagic([u8; 2]),

    /// The peer frames with a header version this build does not speak.
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The frame carries a kind this protocol does not define.
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// The frame payload does not match the layout of its kind.
    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: &'static str, reason: String },

    /// Connection management payload is not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended, either between frames or inside one.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
