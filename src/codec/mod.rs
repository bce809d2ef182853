//! # Body Codec Registry
//!
//! Message bodies are tagged with a single-byte marshaller identifier so
//! peers can decode without any out-of-band negotiation. This module defines
//! the tag type, the object-safe [`Marshaller`] trait, and a process-wide
//! registry of codecs keyed by tag.
//!
//! Three codecs are built in and pre-registered:
//!
//! - `'R'` raw: identity on bytes
//! - `'J'` JSON: `serde_json`
//! - `'P'` protobuf: `prost`-encoded bytes
//!
//! Unknown tags fall back to the JSON marshaller on decode; the raw body
//! bytes are always preserved so handlers can still inspect them through
//! [`Context::raw_data`](crate::Context::raw_data).

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::error::RpcError;

pub mod json;
pub mod protobuf;
pub mod raw;

pub use json::JsonMarshaller;
pub use protobuf::ProtobufMarshaller;
pub use raw::RawMarshaller;

/// Single-byte wire tag identifying a body codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarshalType(pub u8);

impl MarshalType {
    /// Identity on bytes.
    pub const RAW: MarshalType = MarshalType(b'R');
    /// `serde_json` encoding.
    pub const JSON: MarshalType = MarshalType(b'J');
    /// `prost` protobuf encoding.
    pub const PROTOBUF: MarshalType = MarshalType(b'P');
}

impl fmt::Display for MarshalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_ascii_graphic() {
            write!(f, "'{}'", self.0 as char)
        } else {
            write!(f, "0x{:02x}", self.0)
        }
    }
}

/// A body value erased to the two shapes the wire can carry: opaque bytes,
/// or a structured value for self-describing codecs.
#[derive(Debug, Clone)]
pub enum BodyValue<'a> {
    /// Opaque bytes, used by the raw and protobuf codecs.
    Bytes(Cow<'a, [u8]>),
    /// A structured value produced or consumed by serde-based codecs.
    Value(serde_json::Value),
}

impl BodyValue<'_> {
    /// The encoded bytes, when this value is a byte form.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            BodyValue::Bytes(b) => Some(b.into_owned()),
            BodyValue::Value(_) => None,
        }
    }
}

/// A body codec identified by a single-byte wire tag.
///
/// The trait is object safe so codecs can live in the process-wide
/// registry; typed entry points ([`Message`](crate::Message) constructors,
/// the [`Context`](crate::Context) reply and bind helpers) erase values
/// into [`BodyValue`] before routing through it.
pub trait Marshaller: Send + Sync {
    /// The wire tag for bodies produced by this marshaller.
    fn marshal_type(&self) -> MarshalType;

    /// Encode an erased body value.
    fn marshal(&self, value: BodyValue<'_>) -> Result<Vec<u8>, RpcError>;

    /// Decode `data` into an erased body value.
    ///
    /// Codecs without a self-describing format return the bytes untouched;
    /// callers then use the typed helpers instead.
    fn unmarshal<'a>(&self, data: &'a [u8]) -> Result<BodyValue<'a>, RpcError>;
}

fn registry() -> &'static RwLock<HashMap<MarshalType, Arc<dyn Marshaller>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<MarshalType, Arc<dyn Marshaller>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<MarshalType, Arc<dyn Marshaller>> = HashMap::new();
        map.insert(MarshalType::RAW, Arc::new(RawMarshaller));
        map.insert(MarshalType::JSON, Arc::new(JsonMarshaller));
        map.insert(MarshalType::PROTOBUF, Arc::new(ProtobufMarshaller));
        RwLock::new(map)
    })
}

/// Register a marshaller under its own tag.
///
/// Fails with [`RpcError::MarshallerRegistered`] if the tag is taken.
pub fn register_marshaller(marshaller: Arc<dyn Marshaller>) -> Result<(), RpcError> {
    let tag = marshaller.marshal_type();
    let mut map = registry().write();
    if map.contains_key(&tag) {
        return Err(RpcError::MarshallerRegistered(tag));
    }
    map.insert(tag, marshaller);
    Ok(())
}

/// Look up the marshaller for `tag`, falling back to JSON for unknown tags.
pub fn marshaller_for(tag: MarshalType) -> Arc<dyn Marshaller> {
    registry()
        .read()
        .get(&tag)
        .cloned()
        .unwrap_or_else(|| Arc::new(JsonMarshaller))
}
