//! Typed provider messages carried inside frames.
//!
//! Connection management travels as JSON; DATA and ACK carry a little-endian
//! sequence number so acknowledgements can be matched to in-flight sends.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::Frame;
use crate::error::{FrameError, Result};
use crate::kind::FrameKind;

/// Protocol name announced in every connection request.
pub const PROTOCOL_NAME: &str = "fabex-tcp";

/// Protocol version announced in every connection request.
pub const PROTOCOL_VERSION: &str = "1.0";

const SEQ_SIZE: usize = 8;

/// Connection request sent by the connecting endpoint.
///
/// Carries the requester's provider info so the listening side can build a
/// domain and endpoint that match it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol: String,
    pub version: String,
    /// Requested capability bits.
    pub caps: u64,
    /// Requested endpoint type name.
    pub ep_type: String,
    /// Largest message the requester will post.
    pub max_msg_size: usize,
}

impl ConnectRequest {
    pub fn new(caps: u64, ep_type: impl Into<String>, max_msg_size: usize) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            caps,
            ep_type: ep_type.into(),
            max_msg_size,
        }
    }
}

/// Answer to a [`ConnectRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectResponse {
    pub accepted: bool,
    /// Negotiated message size limit both sides apply.
    pub max_msg_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConnectResponse {
    pub fn accept(max_msg_size: usize) -> Self {
        Self {
            accepted: true,
            max_msg_size,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            max_msg_size: 0,
            reason: Some(reason.into()),
        }
    }
}

/// A decoded provider message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    ConnReq(ConnectRequest),
    ConnResp(ConnectResponse),
    Data { seq: u64, payload: Bytes },
    Ack { seq: u64 },
    Shutdown,
}

impl WireMessage {
    /// Frame kind this message is sent as.
    pub fn kind(&self) -> FrameKind {
        match self {
            WireMessage::ConnReq(_) => FrameKind::ConnReq,
            WireMessage::ConnResp(_) => FrameKind::ConnResp,
            WireMessage::Data { .. } => FrameKind::Data,
            WireMessage::Ack { .. } => FrameKind::Ack,
            WireMessage::Shutdown => FrameKind::Shutdown,
        }
    }

    /// Encode into a frame.
    pub fn into_frame(self) -> Result<Frame> {
        let kind = self.kind();
        let payload = match self {
            WireMessage::ConnReq(req) => Bytes::from(serde_json::to_vec(&req)?),
            WireMessage::ConnResp(resp) => Bytes::from(serde_json::to_vec(&resp)?),
            WireMessage::Data { seq, payload } => {
                let mut buf = BytesMut::with_capacity(SEQ_SIZE + payload.len());
                buf.put_u64_le(seq);
                buf.put_slice(&payload);
                buf.freeze()
            }
            WireMessage::Ack { seq } => Bytes::copy_from_slice(&seq.to_le_bytes()),
            WireMessage::Shutdown => Bytes::new(),
        };
        Ok(Frame { kind, payload })
    }

    /// Decode a frame into a message.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        match frame.kind {
            FrameKind::ConnReq => Ok(WireMessage::ConnReq(serde_json::from_slice(&frame.payload)?)),
            FrameKind::ConnResp => {
                Ok(WireMessage::ConnResp(serde_json::from_slice(&frame.payload)?))
            }
            FrameKind::Data => {
                let seq = read_seq(&frame)?;
                Ok(WireMessage::Data {
                    seq,
                    payload: frame.payload.slice(SEQ_SIZE..),
                })
            }
            FrameKind::Ack => {
                if frame.payload.len() != SEQ_SIZE {
                    return Err(malformed(&frame, "ack must carry exactly one sequence number"));
                }
                Ok(WireMessage::Ack {
                    seq: read_seq(&frame)?,
                })
            }
            FrameKind::Shutdown => Ok(WireMessage::Shutdown),
        }
    }
}

fn read_seq(frame: &Frame) -> Result<u64> {
    let bytes: [u8; SEQ_SIZE] = frame
        .payload
        .get(..SEQ_SIZE)
        .and_then(|head| head.try_into().ok())
        .ok_or_else(|| malformed(frame, "missing sequence number"))?;
    Ok(u64::from_le_bytes(bytes))
}

fn malformed(frame: &Frame, reason: &str) -> FrameError {
    FrameError::Malformed {
        kind: frame.kind.as_str(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_keeps_sequence_and_body() {
        let frame = WireMessage::Data {
            seq: 42,
            payload: Bytes::from_static(b"payload"),
        }
        .into_frame()
        .unwrap();
        assert_eq!(frame.kind, FrameKind::Data);

        match WireMessage::from_frame(frame).unwrap() {
            WireMessage::Data { seq, payload } => {
                assert_eq!(seq, 42);
                assert_eq!(payload.as_ref(), b"payload");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn empty_data_message_is_valid() {
        let frame = WireMessage::Data {
            seq: 1,
            payload: Bytes::new(),
        }
        .into_frame()
        .unwrap();
        let decoded = WireMessage::from_frame(frame).unwrap();
        assert_eq!(
            decoded,
            WireMessage::Data {
                seq: 1,
                payload: Bytes::new()
            }
        );
    }

    #[test]
    fn connect_request_is_json() {
        let req = ConnectRequest::new(0b110, "msg", 4096);
        let frame = WireMessage::ConnReq(req.clone()).into_frame().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(json["protocol"], PROTOCOL_NAME);
        assert_eq!(json["max_msg_size"], 4096);

        assert_eq!(
            WireMessage::from_frame(frame).unwrap(),
            WireMessage::ConnReq(req)
        );
    }

    #[test]
    fn reject_response_carries_reason() {
        let frame = WireMessage::ConnResp(ConnectResponse::reject("no overlap"))
            .into_frame()
            .unwrap();
        match WireMessage::from_frame(frame).unwrap() {
            WireMessage::ConnResp(resp) => {
                assert!(!resp.accepted);
                assert_eq!(resp.reason.as_deref(), Some("no overlap"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn short_data_frame_is_malformed() {
        let err = WireMessage::from_frame(Frame::new(FrameKind::Data, Bytes::from_static(b"abc")))
            .unwrap_err();
        assert!(matches!(err, FrameError::Malformed { kind: "DATA", .. }));
    }

    #[test]
    fn ack_with_trailing_bytes_is_malformed() {
        let err = WireMessage::from_frame(Frame::new(FrameKind::Ack, vec![0u8; 9])).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { kind: "ACK", .. }));
    }
}
