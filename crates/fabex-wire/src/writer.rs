use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{Frame, FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};
use crate::message::WireMessage;

/// Blocking frame writer. Each frame goes out in one `write_all` so
/// header and payload are never interleaved with another writer's bytes.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(HEADER_SIZE),
            config,
        }
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.buf.clear();
        frame.encode(&mut self.buf, self.config.max_payload_size)?;
        self.inner
            .write_all(&self.buf)
            .and_then(|()| self.inner.flush())
            .map_err(|err| match err.kind() {
                ErrorKind::WriteZero | ErrorKind::BrokenPipe => FrameError::ConnectionClosed,
                _ => FrameError::Io(err),
            })
    }

    /// Encode and write a provider message.
    pub fn write_message(&mut self, message: WireMessage) -> Result<()> {
        let frame = message.into_frame()?;
        self.write_frame(&frame)
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}
