//! Unified error type for the framework.
//!
//! Remote-visible texts are stable: a server answers a malformed request by
//! copying the `Display` output of the check failure into the `msg_err`
//! header, and clients surface it verbatim as [`RpcError::Remote`].

use thiserror::Error;

use crate::codec::MarshalType;

/// All failure modes surfaced by the framework.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The `msg_type` header is missing or empty.
    #[error("msg type is empty")]
    EmptyMsgType,

    /// A request message carries no `msg_seq` header.
    #[error("msg seq is empty")]
    EmptyMsgSeq,

    /// Operation attempted on a connection or client that has stopped.
    #[error("connection is closed")]
    ConnClosed,

    /// A call returned before its outbound middleware chain reached the
    /// send step, typically because a middleware aborted the chain.
    #[error("message not sent")]
    MessageNotSent,

    /// The outbound frame queue is saturated; the caller may retry.
    #[error("send queue is full")]
    SendQueueFull,

    /// The JSON-encoded header exceeds the 4095-byte wire limit.
    #[error("header is too long")]
    HeaderTooLong,

    /// The body exceeds the 32-bit length field.
    #[error("body is too long")]
    BodyTooLong,

    /// The header JSON of an inbound frame failed to decode.
    #[error("bad header: {0}")]
    BadHeader(#[source] serde_json::Error),

    /// An inbound frame is shorter than its length fields claim.
    #[error("truncated frame")]
    TruncatedFrame,

    /// A marshaller was handed a value it cannot encode or decode.
    #[error("marshaller mismatch: {0}")]
    MarshallerMismatch(&'static str),

    /// A marshaller is already registered under this tag.
    #[error("marshaller already registered: {0}")]
    MarshallerRegistered(MarshalType),

    /// Pending calls abandoned because their connection dropped.
    #[error("connection lost")]
    ConnectionLost,

    /// The peer answered with a non-empty `msg_err` header.
    #[error("remote error: {0}")]
    Remote(String),

    /// The admission hook refused the connection.
    #[error("connection rejected by admission hook")]
    Rejected,

    /// A client was built without a dial address.
    #[error("no dial address configured")]
    MissingAddr,

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protobuf decode: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
