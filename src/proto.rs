//! # Wire Protocol
//!
//! Packs messages into self-describing length-prefixed frames and unpacks
//! them again. All integers are big-endian. The frame layout:
//!
//! ```text
//! offset  size     field
//! 0       4        allSize    total frame length, including this prefix
//! 4       4        msgId      u32, high 16 = model, low 16 = sub
//! 8       1        protoType  marshaller tag ('R', 'J', 'P', …)
//! 9       3        headerLen  u24, at most 4095 (0x0FFF)
//! 12      H        header     JSON-encoded map<string, string>
//! 12+H    4        bodyLen    u32
//! 16+H    bodyLen  body       opaque body bytes
//! ```
//!
//! The tag and header length share one 32-bit word,
//! `(protoType << 24) | headerLen`; the upper bits of the length field are
//! reserved, so decoders mask it with `0x0FFF`. The header map is always
//! JSON-encoded regardless of the body marshaller.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::codec::MarshalType;
use crate::error::RpcError;
use crate::message::{Message, MsgId};

/// Bytes of the leading total-length prefix.
pub const LEN_PREFIX_SIZE: usize = 4;
/// Fixed frame overhead: prefix + msgId + tag/headerLen word + bodyLen.
pub const FRAME_OVERHEAD: usize = 16;
/// Largest JSON-encoded header the 12 significant length bits can carry.
pub const MAX_HEADER_LEN: usize = 0x0FFF;

/// A bidirectional frame codec.
///
/// `unpack` receives the frame *without* its 4-byte length prefix; the
/// connection reader has already consumed it to size the read.
pub trait Proto: Send + Sync {
    /// Encode `msg` into one contiguous frame, length prefix included.
    fn pack(&self, msg: &Message) -> Result<Vec<u8>, RpcError>;

    /// Decode a frame body back into a message. The body bytes are copied
    /// into a fresh buffer so the caller may recycle `frame` immediately.
    fn unpack(&self, frame: &[u8]) -> Result<Message, RpcError>;
}

/// The default frame codec implementing the layout above.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawProto;

impl RawProto {
    pub fn new() -> Self {
        RawProto
    }
}

impl Proto for RawProto {
    fn pack(&self, msg: &Message) -> Result<Vec<u8>, RpcError> {
        let header_json = serde_json::to_vec(msg.header())?;
        if header_json.len() > MAX_HEADER_LEN {
            return Err(RpcError::HeaderTooLong);
        }

        let body = msg.body();
        let body_len = u32::try_from(body.len()).map_err(|_| RpcError::BodyTooLong)?;

        let all_size = FRAME_OVERHEAD + header_json.len() + body.len();
        let mut frame = Vec::with_capacity(all_size);
        frame.extend_from_slice(&(all_size as u32).to_be_bytes());
        frame.extend_from_slice(&msg.msg_id().value().to_be_bytes());
        let word = (msg.marshal_type().0 as u32) << 24 | header_json.len() as u32;
        frame.extend_from_slice(&word.to_be_bytes());
        frame.extend_from_slice(&header_json);
        frame.extend_from_slice(&body_len.to_be_bytes());
        frame.extend_from_slice(body);
        Ok(frame)
    }

    fn unpack(&self, frame: &[u8]) -> Result<Message, RpcError> {
        if frame.len() < FRAME_OVERHEAD - LEN_PREFIX_SIZE {
            return Err(RpcError::TruncatedFrame);
        }

        let msg_id = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let word = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let marshal_type = MarshalType((word >> 24) as u8);
        // Only the low 12 bits of the length field are significant.
        let header_len = (word as usize) & MAX_HEADER_LEN;

        let body_len_at = 8 + header_len;
        if frame.len() < body_len_at + 4 {
            return Err(RpcError::TruncatedFrame);
        }

        let header: HashMap<String, String> = if header_len == 0 {
            HashMap::new()
        } else {
            serde_json::from_slice(&frame[8..body_len_at]).map_err(RpcError::BadHeader)?
        };

        let body_len = u32::from_be_bytes([
            frame[body_len_at],
            frame[body_len_at + 1],
            frame[body_len_at + 2],
            frame[body_len_at + 3],
        ]) as usize;
        let body_at = body_len_at + 4;
        if frame.len() - body_at != body_len {
            return Err(RpcError::TruncatedFrame);
        }

        let body = frame[body_at..].to_vec();
        Ok(Message::new(MsgId::from(msg_id), marshal_type, header, body))
    }
}

/// Decorator over [`RawProto`] that gzip-compresses the body portion only.
///
/// The frame layout is unchanged; the body bytes are simply compressed, so
/// both peers must agree on using this proto.
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipProto {
    inner: RawProto,
}

impl GzipProto {
    pub fn new() -> Self {
        GzipProto { inner: RawProto }
    }
}

impl Proto for GzipProto {
    fn pack(&self, msg: &Message) -> Result<Vec<u8>, RpcError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(msg.body())?;
        let compressed = encoder.finish()?;

        let mut msg = msg.clone();
        msg.set_body(compressed);
        self.inner.pack(&msg)
    }

    fn unpack(&self, frame: &[u8]) -> Result<Message, RpcError> {
        let mut msg = self.inner.unpack(frame)?;
        let mut body = Vec::new();
        GzDecoder::new(msg.body()).read_to_end(&mut body)?;
        msg.set_body(body);
        Ok(msg)
    }
}
