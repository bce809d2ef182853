//! # Message Model
//!
//! The in-memory unit of exchange: a routing id, a body codec tag, a small
//! string-to-string header map, and an opaque body.
//!
//! Routing ids are composite: the high 16 bits select a *model* (a module of
//! related operations) and the low 16 bits a *sub* id within it. Standard
//! header keys carry the message kind, the request sequence number used for
//! reply correlation, and remote error texts. Header values are canonically
//! strings; numeric values ride as decimal ASCII.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::codec::MarshalType;
use crate::error::RpcError;

/// Composite 32-bit routing identifier: high 16 bits `model`, low 16 bits
/// `sub`. Zero is reserved to mean "unspecified".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MsgId(u32);

impl MsgId {
    /// The reserved zero id.
    pub const UNSPECIFIED: MsgId = MsgId(0);

    /// Build an id from its two halves.
    pub fn new(model: u16, sub: u16) -> Self {
        MsgId((model as u32) << 16 | sub as u32)
    }

    /// The model (module) half.
    pub fn model(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The sub (operation) half.
    pub fn sub(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// The packed 32-bit value as it appears on the wire.
    pub fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for MsgId {
    fn from(raw: u32) -> Self {
        MsgId(raw)
    }
}

impl From<MsgId> for u32 {
    fn from(id: MsgId) -> Self {
        id.0
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.model(), self.sub())
    }
}

/// Standard header keys.
pub mod header {
    /// Message kind; see [`MsgType`](super::MsgType).
    pub const MSG_TYPE: &str = "msg_type";
    /// Request sequence number, decimal ASCII of a `u64`.
    pub const MSG_SEQ: &str = "msg_seq";
    /// Text of a remote error carried back in a reply.
    pub const MSG_ERR: &str = "msg_err";
    /// Reserved for trace context propagation middlewares.
    pub const OPEN_TRACE: &str = "open_trace";
}

/// Message kind, string-encoded under the `msg_type` header key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Request,
    Reply,
    Push,
    Heartbeat,
}

impl MsgType {
    /// The wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Request => "request",
            MsgType::Reply => "reply",
            MsgType::Push => "push",
            MsgType::Heartbeat => "heartbeat",
        }
    }

    /// Parse the wire spelling; unknown strings yield `None`.
    pub fn from_str(s: &str) -> Option<MsgType> {
        match s {
            "request" => Some(MsgType::Request),
            "reply" => Some(MsgType::Reply),
            "push" => Some(MsgType::Push),
            "heartbeat" => Some(MsgType::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One application message: routing id, body codec tag, header map, body.
///
/// Invariants enforced at pack time: the JSON-encoded header stays within
/// 4095 bytes and the body within `u32::MAX` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    msg_id: MsgId,
    marshal_type: MarshalType,
    header: HashMap<String, String>,
    body: Vec<u8>,
}

impl Message {
    /// Assemble a message from its four parts.
    pub fn new(
        msg_id: MsgId,
        marshal_type: MarshalType,
        header: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            msg_id,
            marshal_type,
            header,
            body,
        }
    }

    /// An empty message addressed to `msg_id`, tagged JSON.
    pub fn with_id(msg_id: MsgId) -> Self {
        Self::new(msg_id, MarshalType::JSON, HashMap::new(), Vec::new())
    }

    /// A message whose body is opaque bytes.
    pub fn raw(msg_id: MsgId, body: Vec<u8>) -> Self {
        Self::new(msg_id, MarshalType::RAW, HashMap::new(), body)
    }

    /// A message whose body is the JSON encoding of `value`.
    pub fn json<T: Serialize>(msg_id: MsgId, value: &T) -> Result<Self, RpcError> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(msg_id, MarshalType::JSON, HashMap::new(), body))
    }

    /// A message whose body is the protobuf encoding of `value`.
    pub fn protobuf<T: prost::Message>(msg_id: MsgId, value: &T) -> Self {
        Self::new(
            msg_id,
            MarshalType::PROTOBUF,
            HashMap::new(),
            value.encode_to_vec(),
        )
    }

    /// The reserved keepalive message: unspecified id, empty raw body.
    pub fn heartbeat() -> Self {
        let mut msg = Self::raw(MsgId::UNSPECIFIED, Vec::new());
        msg.set_msg_type(MsgType::Heartbeat);
        msg
    }

    pub fn msg_id(&self) -> MsgId {
        self.msg_id
    }

    pub fn marshal_type(&self) -> MarshalType {
        self.marshal_type
    }

    pub fn header(&self) -> &HashMap<String, String> {
        &self.header
    }

    /// Look up a single header value.
    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    /// Insert or replace a header entry.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.header.insert(key.into(), value.into());
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// The message kind, if the `msg_type` header is present and known.
    pub fn msg_type(&self) -> Option<MsgType> {
        self.header_value(header::MSG_TYPE).and_then(MsgType::from_str)
    }

    pub fn set_msg_type(&mut self, msg_type: MsgType) {
        self.set_header(header::MSG_TYPE, msg_type.as_str());
    }

    /// The request sequence number, if present and parseable.
    pub fn seq(&self) -> Option<u64> {
        self.header_value(header::MSG_SEQ)?.parse().ok()
    }

    pub fn set_seq(&mut self, seq: u64) {
        self.set_header(header::MSG_SEQ, seq.to_string());
    }

    /// The remote error text, if the `msg_err` header is non-empty.
    pub fn remote_err(&self) -> Option<&str> {
        self.header_value(header::MSG_ERR).filter(|s| !s.is_empty())
    }

    /// Self-check: a well-formed message carries a non-empty `msg_type`,
    /// and a request additionally carries a non-empty `msg_seq`.
    pub fn check(&self) -> Result<(), RpcError> {
        let msg_type = self.header_value(header::MSG_TYPE).unwrap_or("");
        if msg_type.is_empty() {
            return Err(RpcError::EmptyMsgType);
        }
        if msg_type == MsgType::Request.as_str()
            && self.header_value(header::MSG_SEQ).unwrap_or("").is_empty()
        {
            return Err(RpcError::EmptyMsgSeq);
        }
        Ok(())
    }
}
