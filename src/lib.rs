//! # Weft
//!
//! A small message-oriented TCP RPC framework. A single framed connection
//! multiplexes many sends and receives over bounded queues; clients
//! correlate blocking calls with replies through sequence numbers; servers
//! route messages by a two-level id through chained middleware with
//! next/abort flow control; bodies are tagged with a one-byte codec id so
//! peers decode without negotiation.
//!
//! ```no_run
//! use weft::{Client, ConnConfig, Context, Message, MsgId, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), weft::RpcError> {
//!     let mut router = Router::new();
//!     router.register_handler(1, 1, |ctx: &mut Context| {
//!         let _ = ctx.raw(ctx.msg_id(), b"hello world".to_vec(), None);
//!     });
//!     let server = Server::new(ConnConfig::new(), router);
//!     let accept = server.clone();
//!     tokio::spawn(async move { accept.listen_and_serve("127.0.0.1:7000").await });
//!
//!     let cfg = ConnConfig::new().with_addr("127.0.0.1:7000");
//!     let client = Client::dial(cfg, Router::new()).await?;
//!     let reply = client
//!         .call(Message::raw(MsgId::new(1, 1), b"hello world".to_vec()))
//!         .await?;
//!     assert_eq!(reply.body(), b"hello world");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod message;
pub mod pool;
pub mod proto;
pub mod router;
pub mod server;

pub use client::Client;
pub use codec::{register_marshaller, BodyValue, MarshalType, Marshaller};
pub use config::ConnConfig;
pub use connection::{Connection, Dispatch};
pub use context::Context;
pub use error::RpcError;
pub use message::{header, Message, MsgId, MsgType};
pub use pool::BufferPool;
pub use proto::{GzipProto, Proto, RawProto};
pub use router::{Middleware, Router};
pub use server::Server;

/// The current version of the framework.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    use std::time::Duration;

    /// Outbound queue capacity, in frames.
    pub const MAX_SEND_MSG_NUM: usize = 1000;

    /// Inbound queue capacity, in frames.
    pub const MAX_RECV_MSG_NUM: usize = 10000;

    /// Framing read-buffer size.
    pub const RECV_BUFFER_SIZE: usize = 16 * 1024;

    /// Smallest buffer pool tier.
    pub const BINARY_POOL_MIN_SIZE: usize = 512;

    /// Largest buffer pool tier.
    pub const BINARY_POOL_MAX_SIZE: usize = 512 * 1024;

    /// Socket read deadline (reserved for handshake-style uses).
    pub const READ_TIMEOUT: Duration = Duration::from_secs(3);

    /// Socket write deadline per frame.
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

    /// First reconnect delay.
    pub const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(10);

    /// Reconnect delay ceiling.
    pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(5);

    /// Consecutive reconnect failures tolerated before giving up.
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
}
