//! # Server
//!
//! Accept loop plus per-connection lifecycle: every accepted socket is
//! tuned, wrapped in a framed [`Connection`], offered to the admission hook,
//! registered under a fresh connection id, and started with the routing
//! dispatcher. Handlers run on the blocking pool, one task per message;
//! a panicking handler is logged and the connection survives it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ConnConfig;
use crate::connection::{tune_socket, Connection, Dispatch};
use crate::context::Context;
use crate::error::RpcError;
use crate::message::Message;
use crate::router::Router;

struct ServerInner {
    cfg: ConnConfig,
    dispatcher: Arc<RoutingDispatcher>,
    conns: Mutex<HashMap<u64, Connection>>,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// A TCP RPC server. Cheap to clone; all clones share one accept state.
///
/// The router is taken by value at construction and frozen behind an `Arc`,
/// so every route exists before the first connection is accepted.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(cfg: ConnConfig, router: Router) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                cfg,
                dispatcher: Arc::new(RoutingDispatcher {
                    router: Arc::new(router),
                }),
                conns: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// Bind `addr` and accept connections until [`close`](Self::close) is
    /// called or the listener fails.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<(), RpcError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "server listening");

        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            if self.is_closed() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        tune_socket(&stream, &self.inner.cfg);
                        let conn = Connection::new(stream, peer_addr, self.inner.cfg.clone());
                        self.admit(conn);
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        break;
                    }
                },
            }
        }

        self.drain_connections();
        Ok(())
    }

    /// Run the admission hook, register the connection, and start its
    /// workers. Rejected connections are stopped before any worker spawns.
    fn admit(&self, conn: Connection) {
        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        conn.set_conn_id(conn_id);

        if !(self.inner.cfg.on_conn_handle)(&conn) {
            debug!(conn_id, peer = %conn.peer_addr(), "connection rejected by admission hook");
            conn.stop();
            return;
        }

        debug!(conn_id, peer = %conn.peer_addr(), "connection accepted");
        self.inner.conns.lock().insert(conn_id, conn.clone());
        conn.start(self.inner.dispatcher.clone());

        // Reap the registry entry once the connection ends.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            conn.wait_closed().await;
            inner.conns.lock().remove(&conn_id);
            debug!(conn_id, "connection reaped");
        });
    }

    /// Stop accepting and close every live connection. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("server closing");
        self.inner.shutdown_tx.send_replace(true);
        self.drain_connections();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.conns.lock().len()
    }

    fn drain_connections(&self) {
        let conns: Vec<Connection> = self.inner.conns.lock().drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.stop();
        }
    }
}

/// Routes every inbound message through the router's middleware chain.
struct RoutingDispatcher {
    router: Arc<Router>,
}

#[async_trait]
impl Dispatch for RoutingDispatcher {
    async fn dispatch(&self, conn: Connection, msg: Message) {
        let (model, sub) = (msg.msg_id().model(), msg.msg_id().sub());
        let Some(chain) = self.router.chain(model, sub) else {
            debug!(model, sub, msg_type = ?msg.msg_type(), "no handler registered, dropping");
            return;
        };

        let mut ctx = Context::new(conn, msg, chain);
        // Handlers may block; run the chain on the blocking pool and keep
        // panics from taking the connection down with them.
        match tokio::task::spawn_blocking(move || ctx.next()).await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                error!(model, sub, "handler panicked: {e}");
            }
            Err(e) => {
                warn!(model, sub, error = %e, "handler task failed");
            }
        }
    }
}
