//! Connection configuration.
//!
//! One [`ConnConfig`] value parameterizes both server-accepted and
//! client-dialed connections: queue depths, pool bounds, socket deadlines,
//! the admission hook, the wire proto, and the client-only dial/reconnect
//! settings. Options are builder-style and consume `self`, so a config is
//! assembled in one expression and cloned per connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::defaults;
use crate::proto::{Proto, RawProto};

/// Admission predicate run before a connection's workers spawn; returning
/// `false` rejects the connection and closes the socket.
pub type OnConnHandle = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// Tunables for a framed connection.
#[derive(Clone)]
pub struct ConnConfig {
    /// Outbound queue capacity, in frames.
    pub(crate) max_send_msg_num: usize,
    /// Inbound queue capacity, in frames.
    pub(crate) max_recv_msg_num: usize,
    /// Read-buffer size for the framing reader, also applied to the kernel
    /// socket buffers.
    pub(crate) recv_buffer_size: usize,
    /// Buffer pool tier bounds.
    pub(crate) binary_pool_min_size: usize,
    pub(crate) binary_pool_max_size: usize,
    /// Socket deadlines. The read timeout is reserved for handshake-style
    /// uses; no deadline is armed on the framed read loop, so idle
    /// connections stay alive.
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    /// Optional keepalive interval; when set, the connection ticks a
    /// heartbeat message.
    pub(crate) heartbeat_interval: Option<Duration>,
    /// Admission predicate.
    pub(crate) on_conn_handle: OnConnHandle,
    /// Frame codec.
    pub(crate) proto: Arc<dyn Proto>,
    /// Client dial target.
    pub(crate) addr: Option<String>,
    /// Client auto-reconnect toggle.
    pub(crate) reconnection: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            max_send_msg_num: defaults::MAX_SEND_MSG_NUM,
            max_recv_msg_num: defaults::MAX_RECV_MSG_NUM,
            recv_buffer_size: defaults::RECV_BUFFER_SIZE,
            binary_pool_min_size: defaults::BINARY_POOL_MIN_SIZE,
            binary_pool_max_size: defaults::BINARY_POOL_MAX_SIZE,
            read_timeout: defaults::READ_TIMEOUT,
            write_timeout: defaults::WRITE_TIMEOUT,
            heartbeat_interval: None,
            on_conn_handle: Arc::new(|_| true),
            proto: Arc::new(RawProto::new()),
            addr: None,
            reconnection: true,
        }
    }
}

impl ConnConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the outbound and inbound queue capacities.
    pub fn with_max_msg_num(mut self, send: usize, recv: usize) -> Self {
        self.max_send_msg_num = send;
        self.max_recv_msg_num = recv;
        self
    }

    /// Set the buffer pool tier bounds.
    pub fn with_binary_pool_size(mut self, min: usize, max: usize) -> Self {
        self.binary_pool_min_size = min;
        self.binary_pool_max_size = max;
        self
    }

    /// Set the framing read-buffer size.
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Install the admission predicate.
    pub fn with_on_conn_handle(
        mut self,
        handle: impl Fn(&Connection) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.on_conn_handle = Arc::new(handle);
        self
    }

    /// Swap the wire proto, e.g. for [`GzipProto`](crate::proto::GzipProto).
    pub fn with_proto(mut self, proto: impl Proto + 'static) -> Self {
        self.proto = Arc::new(proto);
        self
    }

    /// Enable the heartbeat ticker at `interval`.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Set the client dial target, e.g. `"127.0.0.1:7000"`.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Toggle client auto-reconnect.
    pub fn with_reconnection(mut self, reconnection: bool) -> Self {
        self.reconnection = reconnection;
        self
    }
}

impl fmt::Debug for ConnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnConfig")
            .field("max_send_msg_num", &self.max_send_msg_num)
            .field("max_recv_msg_num", &self.max_recv_msg_num)
            .field("recv_buffer_size", &self.recv_buffer_size)
            .field("binary_pool_min_size", &self.binary_pool_min_size)
            .field("binary_pool_max_size", &self.binary_pool_max_size)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("addr", &self.addr)
            .field("reconnection", &self.reconnection)
            .finish_non_exhaustive()
    }
}
