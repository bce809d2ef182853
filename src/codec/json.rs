//! JSON codec backed by `serde_json`.

use super::{BodyValue, MarshalType, Marshaller};
use crate::error::RpcError;

/// The `'J'` codec. Structured values are encoded with `serde_json`;
/// byte inputs are treated as pre-encoded JSON and pass through.
///
/// This codec doubles as the registry's fallback for unknown tags.
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn marshal_type(&self) -> MarshalType {
        MarshalType::JSON
    }

    fn marshal(&self, value: BodyValue<'_>) -> Result<Vec<u8>, RpcError> {
        match value {
            BodyValue::Value(v) => Ok(serde_json::to_vec(&v)?),
            BodyValue::Bytes(b) => Ok(b.into_owned()),
        }
    }

    fn unmarshal<'a>(&self, data: &'a [u8]) -> Result<BodyValue<'a>, RpcError> {
        Ok(BodyValue::Value(serde_json::from_slice(data)?))
    }
}
