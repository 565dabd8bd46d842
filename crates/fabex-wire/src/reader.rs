use std::io::{ErrorKind, Read};

use bytes::Bytes;
use tracing::trace;

use crate::codec::{Frame, FrameConfig, FrameHeader, HEADER_SIZE};
use crate::error::{FrameError, Result};
use crate::message::WireMessage;

/// Blocking frame reader: one header read, then exactly the declared
/// payload.
pub struct FrameReader<T> {
    inner: T,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Read the next frame. A stream that ends anywhere, including between
    /// frames, reports [`FrameError::ConnectionClosed`].
    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut raw = [0u8; HEADER_SIZE];
        self.fill(&mut raw)?;
        let header = FrameHeader::decode(&raw, self.config.max_payload_size)?;

        let mut payload = vec![0u8; header.len as usize];
        self.fill(&mut payload)?;
        trace!(kind = %header.kind, len = header.len, "frame read");
        Ok(Frame {
            kind: header.kind,
            payload: Bytes::from(payload),
        })
    }

    /// Read and decode the next provider message.
    pub fn read_message(&mut self) -> Result<WireMessage> {
        WireMessage::from_frame(self.read_frame()?)
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(FrameError::ConnectionClosed),
            Err(err) => Err(FrameError::Io(err)),
        }
    }
}
