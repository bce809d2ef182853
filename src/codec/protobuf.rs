//! Protobuf codec backed by `prost`.

use std::borrow::Cow;

use super::{BodyValue, MarshalType, Marshaller};
use crate::error::RpcError;

/// The `'P'` codec. Protobuf wire bytes are not self-describing, so this
/// marshaller only accepts bytes already produced by a `prost` encoder and
/// returns inbound bodies untouched for typed decoding at the call site
/// ([`Context::bind_protobuf`](crate::Context::bind_protobuf)).
pub struct ProtobufMarshaller;

impl Marshaller for ProtobufMarshaller {
    fn marshal_type(&self) -> MarshalType {
        MarshalType::PROTOBUF
    }

    fn marshal(&self, value: BodyValue<'_>) -> Result<Vec<u8>, RpcError> {
        match value {
            BodyValue::Bytes(b) => Ok(b.into_owned()),
            BodyValue::Value(_) => Err(RpcError::MarshallerMismatch(
                "protobuf marshaller requires a prost-encoded message",
            )),
        }
    }

    fn unmarshal<'a>(&self, data: &'a [u8]) -> Result<BodyValue<'a>, RpcError> {
        Ok(BodyValue::Bytes(Cow::Borrowed(data)))
    }
}
