//! # Dispatch Context
//!
//! A [`Context`] accompanies one inbound message through its middleware
//! chain. The chain is an indexed sequence with an integer cursor: `next`
//! advances and invokes links in order, `abort` parks the cursor on a
//! sentinel so nothing further runs. A link that returns without calling
//! `next` still drops through to the following link, which lets middlewares
//! either wrap the rest of the chain or simply observe and return.
//!
//! The context also carries the reply surface: typed helpers that marshal a
//! value, copy the request header, force `msg_type = reply`, and enqueue the
//! result on the owning connection.

use std::borrow::Cow;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{
    self, BodyValue, JsonMarshaller, MarshalType, Marshaller, ProtobufMarshaller, RawMarshaller,
};
use crate::connection::Connection;
use crate::error::RpcError;
use crate::message::{Message, MsgId, MsgType};
use crate::router::Middleware;

/// Cursor sentinel: any offset at or beyond this value means the chain was
/// aborted.
const ABORT: i16 = 100;

/// Per-message dispatch state and reply surface.
pub struct Context {
    conn: Connection,
    req: Message,
    chain: Vec<Middleware>,
    offset: i16,
}

impl Context {
    pub(crate) fn new(conn: Connection, req: Message, chain: Vec<Middleware>) -> Self {
        Self {
            conn,
            req,
            chain,
            offset: -1,
        }
    }

    /// Advance the cursor and run the remaining links in order, stopping at
    /// the end of the chain or at an abort.
    pub fn next(&mut self) {
        self.offset += 1;
        while (self.offset as usize) < self.chain.len() {
            if self.is_aborted() {
                return;
            }
            let link = self.chain[self.offset as usize].clone();
            (*link)(self);
            self.offset += 1;
        }
    }

    /// Stop dispatch for this message. Links already running are not
    /// interrupted; nothing after them will be invoked.
    pub fn abort(&mut self) {
        self.offset = ABORT;
    }

    pub fn is_aborted(&self) -> bool {
        self.offset >= ABORT
    }

    /// The connection this message arrived on.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The inbound message.
    pub fn req_msg(&self) -> &Message {
        &self.req
    }

    /// Mutable access for middlewares that stamp headers onto the request.
    pub fn req_msg_mut(&mut self) -> &mut Message {
        &mut self.req
    }

    pub fn msg_id(&self) -> MsgId {
        self.req.msg_id()
    }

    /// The request's body codec tag; pair with [`raw_data`](Self::raw_data)
    /// for bodies the typed binds cannot decode.
    pub fn marshal_type(&self) -> MarshalType {
        self.req.marshal_type()
    }

    /// The request body, undecoded.
    pub fn raw_data(&self) -> &[u8] {
        self.req.body()
    }

    /// Decode the request body into `T` using the marshaller named by the
    /// request's tag, falling back to JSON for unknown tags.
    ///
    /// Raw and protobuf bodies are not self-describing; binding them yields
    /// [`RpcError::MarshallerMismatch`]. Use [`raw_data`](Self::raw_data) or
    /// [`bind_protobuf`](Self::bind_protobuf) instead.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        let marshaller = codec::marshaller_for(self.req.marshal_type());
        match marshaller.unmarshal(self.req.body())? {
            BodyValue::Value(value) => Ok(serde_json::from_value(value)?),
            BodyValue::Bytes(_) => Err(RpcError::MarshallerMismatch(
                "body is not self-describing, use raw_data or bind_protobuf",
            )),
        }
    }

    /// Decode the request body as a protobuf message.
    pub fn bind_protobuf<T: prost::Message + Default>(&self) -> Result<T, RpcError> {
        Ok(T::decode(self.req.body())?)
    }

    /// Reply with a JSON body.
    pub fn json<T: Serialize>(
        &self,
        msg_id: MsgId,
        value: &T,
        md: Option<HashMap<String, String>>,
    ) -> Result<(), RpcError> {
        let value = serde_json::to_value(value)?;
        self.reply_with(&JsonMarshaller, BodyValue::Value(value), msg_id, md)
    }

    /// Reply with a protobuf body.
    pub fn protobuf<T: prost::Message>(
        &self,
        msg_id: MsgId,
        value: &T,
        md: Option<HashMap<String, String>>,
    ) -> Result<(), RpcError> {
        let body = BodyValue::Bytes(Cow::Owned(value.encode_to_vec()));
        self.reply_with(&ProtobufMarshaller, body, msg_id, md)
    }

    /// Reply with opaque bytes.
    pub fn raw(
        &self,
        msg_id: MsgId,
        body: Vec<u8>,
        md: Option<HashMap<String, String>>,
    ) -> Result<(), RpcError> {
        self.reply_with(&RawMarshaller, BodyValue::Bytes(Cow::Owned(body)), msg_id, md)
    }

    /// Shared reply path: marshal, copy the request header, overlay `md`,
    /// force the reply type, enqueue.
    fn reply_with(
        &self,
        marshaller: &dyn Marshaller,
        body: BodyValue<'_>,
        msg_id: MsgId,
        md: Option<HashMap<String, String>>,
    ) -> Result<(), RpcError> {
        let body = marshaller.marshal(body)?;
        let mut headers = self.req.header().clone();
        if let Some(extra) = md {
            headers.extend(extra);
        }
        let mut reply = Message::new(msg_id, marshaller.marshal_type(), headers, body);
        reply.set_msg_type(MsgType::Reply);
        self.conn.send_msg(&reply)
    }
}
