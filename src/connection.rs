//! # Framed Connection
//!
//! A full-duplex TCP connection that exchanges length-prefixed frames
//! through bounded queues. `start` spawns three long-lived workers:
//!
//! - **receiver**: reads the 4-byte length prefix, sizes a pooled buffer,
//!   reads the frame, and enqueues it inbound. A full inbound queue closes
//!   the connection, since inbound frames are driven by the remote peer and
//!   cannot be dropped silently.
//! - **sender**: drains the outbound queue and writes each frame whole,
//!   under the configured write timeout.
//! - **dispatch pump**: unpacks inbound frames, recycles their buffers,
//!   answers malformed requests with an error reply, and hands everything
//!   else to the [`Dispatch`] implementation on a fresh task so slow
//!   handlers never stall the pump.
//!
//! Stop runs exactly once regardless of who triggers it: it drops the
//! socket, closes both queues, and flips a one-shot notification that any
//! interested party can await through [`Connection::wait_closed`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ConnConfig;
use crate::error::RpcError;
use crate::message::{header, Message, MsgType};
use crate::pool::BufferPool;
use crate::proto::{FRAME_OVERHEAD, LEN_PREFIX_SIZE};

/// Receives every decoded inbound message of a connection.
///
/// The server routes messages through its router; the client demultiplexes
/// replies into its pending-call table and routes pushes. Each call runs on
/// its own task, so implementations may take their time.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, conn: Connection, msg: Message);
}

/// Socket state handed to `start`, absent once the workers own the halves.
struct IoParts {
    stream: TcpStream,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
}

struct Shared {
    conn_id: AtomicU64,
    peer_addr: SocketAddr,
    cfg: ConnConfig,
    pool: Arc<BufferPool>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    io: Mutex<Option<IoParts>>,
    stopped: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// Cheap cloneable handle to one framed connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer_addr: SocketAddr, cfg: ConnConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(cfg.max_send_msg_num);
        let (closed_tx, _) = watch::channel(false);
        let pool = Arc::new(BufferPool::new(
            cfg.binary_pool_min_size,
            cfg.binary_pool_max_size,
        ));
        Self {
            shared: Arc::new(Shared {
                conn_id: AtomicU64::new(0),
                peer_addr,
                cfg,
                pool,
                outbound_tx,
                io: Mutex::new(Some(IoParts {
                    stream,
                    outbound_rx,
                })),
                stopped: AtomicBool::new(false),
                closed_tx,
            }),
        }
    }

    /// The server-assigned connection id, zero until assigned.
    pub fn conn_id(&self) -> u64 {
        self.shared.conn_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_conn_id(&self, conn_id: u64) {
        self.shared.conn_id.store(conn_id, Ordering::Relaxed);
    }

    /// The remote endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Pack `msg` and enqueue the frame without blocking on the network.
    ///
    /// Fails with [`RpcError::SendQueueFull`] when the outbound queue is
    /// saturated and [`RpcError::ConnClosed`] once the connection stopped.
    pub fn send_msg(&self, msg: &Message) -> Result<(), RpcError> {
        if self.is_stopped() {
            return Err(RpcError::ConnClosed);
        }
        let frame = self.shared.cfg.proto.pack(msg)?;
        match self.shared.outbound_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RpcError::SendQueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RpcError::ConnClosed),
        }
    }

    /// Spawn the receiver, sender, dispatch pump, and (when configured) the
    /// heartbeat ticker. A connection starts at most once.
    pub(crate) fn start(&self, dispatcher: Arc<dyn Dispatch>) {
        let Some(io) = self.shared.io.lock().take() else {
            debug!(conn_id = self.conn_id(), "connection already started or stopped");
            return;
        };
        let IoParts {
            stream,
            outbound_rx,
        } = io;
        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::with_capacity(self.shared.cfg.recv_buffer_size, read_half);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.shared.cfg.max_recv_msg_num);

        let pool = self.shared.pool.clone();
        let conn = self.clone();
        let closed = self.shared.closed_tx.subscribe();
        tokio::spawn(async move {
            recv_loop(reader, pool, inbound_tx, closed).await;
            conn.stop();
        });

        let conn = self.clone();
        let closed = self.shared.closed_tx.subscribe();
        let write_timeout = self.shared.cfg.write_timeout;
        tokio::spawn(async move {
            send_loop(write_half, outbound_rx, write_timeout, closed).await;
            conn.stop();
        });

        let conn = self.clone();
        let closed = self.shared.closed_tx.subscribe();
        tokio::spawn(async move {
            pump_loop(conn.clone(), inbound_rx, dispatcher, closed).await;
            conn.stop();
        });

        if let Some(interval) = self.shared.cfg.heartbeat_interval {
            let conn = self.clone();
            let closed = self.shared.closed_tx.subscribe();
            tokio::spawn(async move {
                heartbeat_loop(conn, interval, closed).await;
            });
        }
    }

    /// Stop the connection. Idempotent; only the first caller closes the
    /// socket and signals the stop notification.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            conn_id = self.conn_id(),
            peer = %self.shared.peer_addr,
            "connection stopped"
        );
        // Drop the socket if the connection never started; started workers
        // observe the notification and drop their halves themselves.
        self.shared.io.lock().take();
        self.shared.closed_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Wait for the one-shot stop notification. Returns immediately if the
    /// connection already stopped.
    pub async fn wait_closed(&self) {
        let mut closed = self.shared.closed_tx.subscribe();
        wait_flag(&mut closed).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id())
            .field("peer_addr", &self.shared.peer_addr)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Set TCP_NODELAY and size the kernel buffers to the framing buffer size.
/// Tuning failures are not fatal.
pub(crate) fn tune_socket(stream: &TcpStream, cfg: &ConnConfig) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }
    let _ = sock.set_recv_buffer_size(cfg.recv_buffer_size);
    let _ = sock.set_send_buffer_size(cfg.recv_buffer_size);
}

/// Resolve once the watch flag turns true (or its sender goes away).
async fn wait_flag(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow_and_update() {
        return;
    }
    let _ = rx.changed().await;
}

/// Read frames off the socket into the bounded inbound queue.
///
/// A frame-boundary EOF is retried once; everything else that goes wrong
/// ends the loop and with it the connection.
async fn recv_loop<R>(
    mut reader: R,
    pool: Arc<BufferPool>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    mut closed: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut eof_retried = false;
    loop {
        let mut len_buf = [0u8; LEN_PREFIX_SIZE];
        tokio::select! {
            _ = wait_flag(&mut closed) => return,
            res = reader.read_exact(&mut len_buf) => match res {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    if eof_retried {
                        debug!("peer closed the read side");
                        return;
                    }
                    eof_retried = true;
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "read error");
                    return;
                }
            },
        }
        eof_retried = false;

        let all_size = u32::from_be_bytes(len_buf) as usize;
        if all_size < FRAME_OVERHEAD {
            warn!(all_size, "undersized frame length from peer");
            return;
        }
        let mut frame = pool.get(all_size - LEN_PREFIX_SIZE);
        tokio::select! {
            _ = wait_flag(&mut closed) => return,
            res = reader.read_exact(&mut frame) => {
                if let Err(e) = res {
                    debug!(error = %e, "read error mid-frame");
                    return;
                }
            }
        }

        match inbound_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The peer outpaces the consumer; backpressure cannot be
                // honored without stalling reads, so the connection dies.
                warn!("inbound queue full, closing connection");
                return;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

/// Drain the outbound queue onto the socket, one whole frame per write,
/// each under the write timeout.
async fn send_loop<W>(
    mut writer: W,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
    mut closed: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = wait_flag(&mut closed) => return,
            f = outbound_rx.recv() => match f {
                Some(f) => f,
                None => return,
            },
        };
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "write error");
                return;
            }
            Err(_) => {
                warn!("write timed out");
                return;
            }
        }
    }
}

/// Unpack inbound frames and fan them out to the dispatcher.
async fn pump_loop(
    conn: Connection,
    mut inbound_rx: mpsc::Receiver<Vec<u8>>,
    dispatcher: Arc<dyn Dispatch>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = wait_flag(&mut closed) => return,
            f = inbound_rx.recv() => match f {
                Some(f) => f,
                None => return,
            },
        };

        let msg = match conn.shared.cfg.proto.unpack(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "failed to unpack inbound frame");
                return;
            }
        };
        // The body was copied out during unpack, so the frame buffer can go
        // straight back to the pool.
        conn.shared.pool.put(frame);

        if let Err(err) = msg.check() {
            if msg.msg_type() == Some(MsgType::Request) {
                let mut md = msg.header().clone();
                md.insert(header::MSG_ERR.to_string(), err.to_string());
                let mut reply =
                    Message::new(msg.msg_id(), msg.marshal_type(), md, Vec::new());
                reply.set_msg_type(MsgType::Reply);
                if let Err(e) = conn.send_msg(&reply) {
                    debug!(error = %e, "failed to answer malformed request");
                }
                continue;
            }
            // Malformed non-requests still reach the dispatcher, which is
            // free to drop them.
        }

        let dispatcher = dispatcher.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(conn, msg).await;
        });
    }
}

/// Tick a keepalive message at the configured interval.
async fn heartbeat_loop(conn: Connection, interval: Duration, mut closed: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately; heartbeats should
    // start one interval after the connection comes up.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = wait_flag(&mut closed) => return,
            _ = ticker.tick() => match conn.send_msg(&Message::heartbeat()) {
                Ok(()) => {}
                Err(RpcError::SendQueueFull) => warn!("heartbeat dropped, send queue full"),
                Err(_) => return,
            },
        }
    }
}
