//! # Router
//!
//! Two-level message routing: the high half of a [`MsgId`](crate::MsgId)
//! selects a *model*, the low half a handler within it. Around every handler
//! sits an ordered middleware chain assembled from three scopes:
//!
//! ```text
//! global ... -> model ... -> handler middlewares ... -> handler
//! ```
//!
//! Registration happens while the router is still owned mutably; servers and
//! clients take the router by value at construction and freeze it behind an
//! `Arc`, so registering after start does not compile. Dispatch therefore
//! reads the tables without locking.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Context;

/// One link of a dispatch chain. Middlewares and handlers share this shape;
/// a middleware usually calls [`Context::next`], a handler usually does not,
/// but neither is required to (control drops through on return).
pub type Middleware = Arc<dyn Fn(&mut Context) + Send + Sync>;

#[derive(Default)]
struct ModelEntry {
    middlewares: Vec<Middleware>,
    handlers: HashMap<u16, Middleware>,
    handler_middlewares: HashMap<u16, Vec<Middleware>>,
}

/// Routing table mapping `(model, sub)` ids to handlers and their
/// middleware chains.
#[derive(Default)]
pub struct Router {
    global: Vec<Middleware>,
    models: HashMap<u16, ModelEntry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware that runs for every dispatched message.
    pub fn register_global_middleware(
        &mut self,
        middleware: impl Fn(&mut Context) + Send + Sync + 'static,
    ) {
        self.global.push(Arc::new(middleware));
    }

    /// Append a middleware that runs for every message of `model`.
    pub fn register_model_middleware(
        &mut self,
        model: u16,
        middleware: impl Fn(&mut Context) + Send + Sync + 'static,
    ) {
        self.models
            .entry(model)
            .or_default()
            .middlewares
            .push(Arc::new(middleware));
    }

    /// Install the handler for `(model, sub)`.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already installed there; overlapping routes
    /// are a programming error, not a runtime condition.
    pub fn register_handler(
        &mut self,
        model: u16,
        sub: u16,
        handler: impl Fn(&mut Context) + Send + Sync + 'static,
    ) {
        let entry = self.models.entry(model).or_default();
        if entry.handlers.contains_key(&sub) {
            panic!("handler already registered for ({model}, {sub})");
        }
        entry.handlers.insert(sub, Arc::new(handler));
    }

    /// Append a middleware that runs only for the handler at `(model, sub)`.
    pub fn register_handler_middleware(
        &mut self,
        model: u16,
        sub: u16,
        middleware: impl Fn(&mut Context) + Send + Sync + 'static,
    ) {
        self.models
            .entry(model)
            .or_default()
            .handler_middlewares
            .entry(sub)
            .or_default()
            .push(Arc::new(middleware));
    }

    /// Assemble the full dispatch chain for `(model, sub)`, or `None` when
    /// no handler is installed there.
    pub(crate) fn chain(&self, model: u16, sub: u16) -> Option<Vec<Middleware>> {
        let entry = self.models.get(&model)?;
        let handler = entry.handlers.get(&sub)?.clone();

        let handler_mws = entry
            .handler_middlewares
            .get(&sub)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let mut chain =
            Vec::with_capacity(self.global.len() + entry.middlewares.len() + handler_mws.len() + 1);
        chain.extend(self.global.iter().cloned());
        chain.extend(entry.middlewares.iter().cloned());
        chain.extend(handler_mws.iter().cloned());
        chain.push(handler);
        Some(chain)
    }

    /// The global middleware list alone, used by the client to wrap its
    /// outbound send step.
    pub(crate) fn global_chain(&self) -> Vec<Middleware> {
        self.global.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnConfig;
    use crate::connection::Connection;
    use crate::message::{Message, MsgId, MsgType};
    use parking_lot::Mutex;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_conn() -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        drop(server.unwrap());
        let stream = client.unwrap();
        let peer = stream.peer_addr().unwrap();
        Connection::new(stream, peer, ConnConfig::new())
    }

    fn request(model: u16, sub: u16) -> Message {
        let mut msg = Message::raw(MsgId::new(model, sub), Vec::new());
        msg.set_msg_type(MsgType::Request);
        msg.set_seq(1);
        msg
    }

    #[tokio::test]
    async fn chain_runs_in_registration_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut router = Router::new();

        let t = trace.clone();
        router.register_global_middleware(move |_| t.lock().push("global1"));
        let t = trace.clone();
        router.register_global_middleware(move |_| t.lock().push("global2"));
        let t = trace.clone();
        router.register_model_middleware(1, move |_| t.lock().push("model"));
        let t = trace.clone();
        router.register_handler_middleware(1, 1, move |_| t.lock().push("handler_mw"));
        let t = trace.clone();
        router.register_handler(1, 1, move |_| t.lock().push("handler"));
        // A foreign model's middleware must not leak into the chain.
        let t = trace.clone();
        router.register_model_middleware(2, move |_| t.lock().push("other_model"));

        let chain = router.chain(1, 1).unwrap();
        let mut ctx = Context::new(test_conn().await, request(1, 1), chain);
        ctx.next();

        assert_eq!(
            *trace.lock(),
            vec!["global1", "global2", "model", "handler_mw", "handler"]
        );
    }

    #[tokio::test]
    async fn middleware_drops_through_without_next() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut router = Router::new();
        // Neither link calls next; both must still run.
        router.register_global_middleware({
            let t = trace.clone();
            move |_| t.lock().push("mw")
        });
        router.register_handler(1, 1, {
            let t = trace.clone();
            move |_| t.lock().push("handler")
        });

        let chain = router.chain(1, 1).unwrap();
        let mut ctx = Context::new(test_conn().await, request(1, 1), chain);
        ctx.next();
        assert_eq!(*trace.lock(), vec!["mw", "handler"]);
    }

    #[tokio::test]
    async fn abort_stops_the_rest_of_the_chain() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut router = Router::new();
        router.register_global_middleware({
            let t = trace.clone();
            move |ctx: &mut Context| {
                t.lock().push("guard");
                ctx.abort();
            }
        });
        router.register_handler(1, 1, {
            let t = trace.clone();
            move |_| t.lock().push("handler")
        });

        let chain = router.chain(1, 1).unwrap();
        let mut ctx = Context::new(test_conn().await, request(1, 1), chain);
        ctx.next();
        assert_eq!(*trace.lock(), vec!["guard"]);
    }

    #[tokio::test]
    async fn wrapping_middleware_sees_the_handler_finish() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut router = Router::new();
        router.register_global_middleware({
            let t = trace.clone();
            move |ctx: &mut Context| {
                t.lock().push("before");
                ctx.next();
                t.lock().push("after");
            }
        });
        router.register_handler(1, 1, {
            let t = trace.clone();
            move |_| t.lock().push("handler")
        });

        let chain = router.chain(1, 1).unwrap();
        let mut ctx = Context::new(test_conn().await, request(1, 1), chain);
        ctx.next();
        assert_eq!(*trace.lock(), vec!["before", "handler", "after"]);
    }

    #[test]
    fn unrouted_ids_have_no_chain() {
        let mut router = Router::new();
        router.register_handler(1, 1, |_| {});
        assert!(router.chain(1, 2).is_none());
        assert!(router.chain(2, 1).is_none());
        assert!(router.chain(1, 1).is_some());
    }

    #[test]
    #[should_panic(expected = "handler already registered")]
    fn duplicate_handler_registration_panics() {
        let mut router = Router::new();
        router.register_handler(1, 1, |_| {});
        router.register_handler(1, 1, |_| {});
    }
}
