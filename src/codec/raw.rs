//! Identity codec for opaque byte bodies.

use std::borrow::Cow;

use super::{BodyValue, MarshalType, Marshaller};
use crate::error::RpcError;

/// The `'R'` codec: bytes pass through untouched.
///
/// Decoding is a no-op by design; a typed bind against a raw body cannot
/// succeed, so consumers read the payload through
/// [`Context::raw_data`](crate::Context::raw_data).
pub struct RawMarshaller;

impl Marshaller for RawMarshaller {
    fn marshal_type(&self) -> MarshalType {
        MarshalType::RAW
    }

    fn marshal(&self, value: BodyValue<'_>) -> Result<Vec<u8>, RpcError> {
        match value {
            BodyValue::Bytes(b) => Ok(b.into_owned()),
            BodyValue::Value(_) => Err(RpcError::MarshallerMismatch(
                "raw marshaller requires a byte buffer",
            )),
        }
    }

    fn unmarshal<'a>(&self, data: &'a [u8]) -> Result<BodyValue<'a>, RpcError> {
        Ok(BodyValue::Bytes(Cow::Borrowed(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_pass_through() {
        let out = RawMarshaller
            .marshal(BodyValue::Bytes(Cow::Borrowed(b"payload")))
            .unwrap();
        assert_eq!(out, b"payload");

        let back = RawMarshaller.unmarshal(b"payload").unwrap();
        assert_eq!(back.into_bytes().unwrap(), b"payload");
    }

    #[test]
    fn structured_values_are_rejected() {
        let err = RawMarshaller
            .marshal(BodyValue::Value(serde_json::json!({"k": 1})))
            .unwrap_err();
        assert!(matches!(err, RpcError::MarshallerMismatch(_)));
    }
}
