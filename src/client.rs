//! # Client
//!
//! Dials a server, correlates blocking calls with their replies, and keeps
//! the connection alive across drops.
//!
//! Every [`call`](Client::call) allocates a sequence number from a counter
//! guarded by the same mutex as the pending-call table, so inserting and
//! removing entries are single critical sections. The request then runs
//! through the client's global middleware chain whose final link performs
//! the actual enqueue, and the caller awaits a oneshot completion that the
//! receive path fulfills when the matching `msg_seq` comes back. Dropping
//! the call future is cancellation: a guard removes the pending entry and a
//! late reply is dropped silently.
//!
//! A supervisor task watches the connection's stop notification. On loss it
//! fails all in-flight calls, then redials with exponential backoff (10 ms
//! doubling to a 5 s cap); ten consecutive failures mark the client closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::config::ConnConfig;
use crate::connection::{tune_socket, Connection, Dispatch};
use crate::context::Context;
use crate::defaults;
use crate::error::RpcError;
use crate::message::{Message, MsgType};
use crate::router::Router;

/// One outstanding request: the oneshot carries either the reply or the
/// error that ended the call.
struct PendingCall {
    tx: oneshot::Sender<Result<Message, RpcError>>,
}

/// Sequence counter and outstanding calls, under one lock so allocation and
/// completion are each a single critical section.
struct PendingTable {
    next_seq: u64,
    calls: HashMap<u64, PendingCall>,
}

struct ClientInner {
    cfg: ConnConfig,
    addr: String,
    router: Arc<Router>,
    pending: Mutex<PendingTable>,
    conn: Mutex<Option<Connection>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

/// A dialing RPC client. Cheap to clone; all clones share one connection,
/// pending table, and router.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect to `cfg.addr`, start the connection, and spawn the
    /// reconnection supervisor.
    ///
    /// The router carries the client's push handlers and the global
    /// middlewares that wrap outbound calls; it is frozen here.
    pub async fn dial(cfg: ConnConfig, router: Router) -> Result<Self, RpcError> {
        let addr = cfg.addr.clone().ok_or(RpcError::MissingAddr)?;
        let (close_tx, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            cfg,
            addr,
            router: Arc::new(router),
            pending: Mutex::new(PendingTable {
                next_seq: 1,
                calls: HashMap::new(),
            }),
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_tx,
        });

        let conn = ClientInner::connect(&inner).await?;
        *inner.conn.lock() = Some(conn.clone());
        spawn_supervisor(&inner, conn);

        Ok(Self { inner })
    }

    /// Issue a request and wait for the matching reply.
    ///
    /// Sets `msg_seq` and `msg_type = request` on the message. Dropping the
    /// returned future cancels the call; wrap it in
    /// `tokio::time::timeout` for a deadline.
    pub async fn call(&self, mut msg: Message) -> Result<Message, RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnClosed);
        }
        let conn = self.current_conn().ok_or(RpcError::ConnClosed)?;

        let (seq, rx) = {
            let mut pending = self.inner.pending.lock();
            let seq = pending.next_seq;
            pending.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            pending.calls.insert(seq, PendingCall { tx });
            (seq, rx)
        };
        let mut guard = PendingGuard {
            inner: &self.inner,
            seq,
            armed: true,
        };

        msg.set_seq(seq);
        msg.set_msg_type(MsgType::Request);

        // The outbound path is the global middleware chain with the actual
        // send as its final link, so middlewares can stamp headers or abort
        // before anything hits the wire.
        let send_result: Arc<Mutex<Option<Result<(), RpcError>>>> = Arc::new(Mutex::new(None));
        let mut chain = self.inner.router.global_chain();
        let slot = send_result.clone();
        chain.push(Arc::new(move |ctx: &mut Context| {
            *slot.lock() = Some(ctx.connection().send_msg(ctx.req_msg()));
        }));

        let mut ctx = Context::new(conn, msg, chain);
        ctx.next();

        match send_result.lock().take() {
            None => return Err(RpcError::MessageNotSent),
            Some(Err(e)) => return Err(e),
            Some(Ok(())) => {}
        }

        match rx.await {
            Ok(result) => {
                // Completed entries were removed by whoever fulfilled them.
                guard.armed = false;
                result
            }
            Err(_) => {
                guard.armed = false;
                Err(RpcError::ConnectionLost)
            }
        }
    }

    /// Fire-and-forget send. Sets `msg_type = request` when absent and does
    /// not allocate a pending entry, so no reply will be routed back.
    pub fn send(&self, mut msg: Message) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnClosed);
        }
        let conn = self.current_conn().ok_or(RpcError::ConnClosed)?;
        if msg.msg_type().is_none() {
            msg.set_msg_type(MsgType::Request);
        }
        conn.send_msg(&msg)
    }

    /// Close the client: drop the connection first, then fail whatever is
    /// still pending. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The number of in-flight calls, exposed for diagnostics.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().calls.len()
    }

    fn current_conn(&self) -> Option<Connection> {
        self.inner.conn.lock().clone()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.inner.addr)
            .field("closed", &self.is_closed())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

/// Removes the pending entry when a call ends without being fulfilled
/// (send failure, middleware abort, or the caller dropping the future).
struct PendingGuard<'a> {
    inner: &'a ClientInner,
    seq: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.pending.lock().calls.remove(&self.seq);
        }
    }
}

impl ClientInner {
    /// Dial, tune, admit, and start one connection.
    async fn connect(inner: &Arc<ClientInner>) -> Result<Connection, RpcError> {
        let stream = TcpStream::connect(&inner.addr).await?;
        tune_socket(&stream, &inner.cfg);
        let peer_addr = stream.peer_addr()?;
        let conn = Connection::new(stream, peer_addr, inner.cfg.clone());

        if !(inner.cfg.on_conn_handle)(&conn) {
            conn.stop();
            return Err(RpcError::Rejected);
        }

        conn.start(Arc::new(DemuxDispatcher {
            inner: Arc::downgrade(inner),
        }));
        debug!(peer = %peer_addr, "client connected");
        Ok(conn)
    }

    /// Complete the pending entry for an inbound reply; late or unknown
    /// sequence numbers are dropped silently.
    fn complete_reply(&self, msg: Message) {
        let Some(seq) = msg.seq() else {
            debug!("reply without msg_seq, dropping");
            return;
        };
        let Some(call) = self.pending.lock().calls.remove(&seq) else {
            trace!(seq, "no pending call for reply, dropping");
            return;
        };
        let result = match msg.remote_err() {
            Some(text) => Err(RpcError::Remote(text.to_string())),
            None => Ok(msg),
        };
        // A cancelled caller has dropped its receiver; nothing to do then.
        let _ = call.tx.send(result);
    }

    /// Fail every in-flight call with `ConnectionLost`.
    fn fail_pending(&self) {
        let calls: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            pending.calls.drain().map(|(_, call)| call).collect()
        };
        if !calls.is_empty() {
            debug!(count = calls.len(), "failing pending calls");
        }
        for call in calls {
            let _ = call.tx.send(Err(RpcError::ConnectionLost));
        }
    }

    /// Mark closed, stop the connection, then clear the pending table.
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("client closing");
        self.close_tx.send_replace(true);
        if let Some(conn) = self.conn.lock().take() {
            conn.stop();
        }
        self.fail_pending();
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // An un-closed client still tears its connection down.
        if let Some(conn) = self.conn.lock().take() {
            conn.stop();
        }
    }
}

/// Watches the live connection and redials when it stops.
fn spawn_supervisor(inner: &Arc<ClientInner>, conn: Connection) {
    let weak = Arc::downgrade(inner);
    let mut close_rx = inner.close_tx.subscribe();
    let mut conn = conn;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = close_rx.changed() => return,
                _ = conn.wait_closed() => {
                    let Some(inner) = weak.upgrade() else { return };
                    inner.fail_pending();
                    if inner.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    if !inner.cfg.reconnection {
                        warn!("connection lost and reconnection is disabled");
                        inner.shutdown();
                        return;
                    }
                    match redial(&inner).await {
                        Some(new_conn) => {
                            if inner.closed.load(Ordering::SeqCst) {
                                // Closed while we were redialing.
                                new_conn.stop();
                                return;
                            }
                            *inner.conn.lock() = Some(new_conn.clone());
                            conn = new_conn;
                        }
                        None => {
                            inner.shutdown();
                            return;
                        }
                    }
                }
            }
        }
    });
}

/// Reconnect with exponential backoff. Returns `None` once the attempt
/// limit is spent or the client closed underneath us.
async fn redial(inner: &Arc<ClientInner>) -> Option<Connection> {
    let mut delay = defaults::RECONNECT_BACKOFF_INITIAL;
    for attempt in 1..=defaults::MAX_RECONNECT_ATTEMPTS {
        if inner.closed.load(Ordering::SeqCst) {
            return None;
        }
        match ClientInner::connect(inner).await {
            Ok(conn) => {
                info!(attempt, "reconnected");
                return Some(conn);
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }
        if attempt < defaults::MAX_RECONNECT_ATTEMPTS {
            sleep(delay).await;
            delay = (delay * 2).min(defaults::RECONNECT_BACKOFF_MAX);
        }
    }
    warn!("reconnect attempts exhausted, closing client");
    None
}

/// Client-side inbound demultiplexer: replies complete pending calls,
/// everything else goes through the router like a server would.
struct DemuxDispatcher {
    inner: Weak<ClientInner>,
}

#[async_trait]
impl Dispatch for DemuxDispatcher {
    async fn dispatch(&self, conn: Connection, msg: Message) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match msg.msg_type() {
            Some(MsgType::Reply) => inner.complete_reply(msg),
            _ => {
                let (model, sub) = (msg.msg_id().model(), msg.msg_id().sub());
                let Some(chain) = inner.router.chain(model, sub) else {
                    debug!(model, sub, msg_type = ?msg.msg_type(), "unhandled message, dropping");
                    return;
                };
                let mut ctx = Context::new(conn, msg, chain);
                match tokio::task::spawn_blocking(move || ctx.next()).await {
                    Ok(()) => {}
                    Err(e) if e.is_panic() => {
                        tracing::error!(model, sub, "handler panicked: {e}");
                    }
                    Err(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MsgId;

    #[tokio::test]
    async fn dial_without_addr_fails() {
        let err = Client::dial(ConnConfig::new(), Router::new())
            .await
            .expect_err("no addr configured");
        assert!(matches!(err, RpcError::MissingAddr));
    }

    #[tokio::test]
    async fn dial_against_a_dead_port_fails() {
        let cfg = ConnConfig::new().with_addr("127.0.0.1:1");
        assert!(Client::dial(cfg, Router::new()).await.is_err());
    }

    #[tokio::test]
    async fn admission_hook_can_reject_the_dial() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let cfg = ConnConfig::new()
            .with_addr(addr.to_string())
            .with_on_conn_handle(|_| false);
        let err = Client::dial(cfg, Router::new()).await.expect_err("rejected");
        assert!(matches!(err, RpcError::Rejected));
        let _ = accept.await;
    }

    #[tokio::test]
    async fn send_requires_a_live_client() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the socket open until the test finishes.
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            drop(stream);
        });

        let cfg = ConnConfig::new()
            .with_addr(addr.to_string())
            .with_reconnection(false);
        let client = Client::dial(cfg, Router::new()).await.unwrap();
        client
            .send(Message::raw(MsgId::new(1, 1), b"fire".to_vec()))
            .unwrap();

        client.close();
        assert!(client.is_closed());
        assert!(matches!(
            client.send(Message::raw(MsgId::new(1, 1), Vec::new())),
            Err(RpcError::ConnClosed)
        ));
        assert_eq!(client.pending_calls(), 0);
        let _ = accept.await;
    }
}
