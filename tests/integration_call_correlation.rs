use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;
use weft::proto::LEN_PREFIX_SIZE;
use weft::{
    Client, ConnConfig, Context, Message, MsgId, MsgType, Proto, RawProto, Router, RpcError,
    Server,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn spawn_echo_after_delay_server(addr: &'static str) -> Server {
    let mut router = Router::new();
    // The request body names a delay in milliseconds; the handler sleeps
    // that long, then echoes the body back.
    router.register_handler(1, 1, |ctx: &mut Context| {
        let body = ctx.raw_data().to_vec();
        let delay: u64 = String::from_utf8_lossy(&body).parse().unwrap_or(0);
        std::thread::sleep(Duration::from_millis(delay));
        let _ = ctx.raw(ctx.msg_id(), body, None);
    });
    let server = Server::new(ConnConfig::new(), router);
    let accept = server.clone();
    tokio::spawn(async move { accept.listen_and_serve(addr).await });
    sleep(Duration::from_millis(100)).await;
    server
}

/// Concurrent calls must each receive the reply matching their own
/// sequence number, independent of reply arrival order.
#[tokio::test]
async fn concurrent_calls_correlate_by_sequence() -> Result<()> {
    init_logging();
    let server = spawn_echo_after_delay_server("127.0.0.1:18311").await;

    let client = Client::dial(
        ConnConfig::new().with_addr("127.0.0.1:18311"),
        Router::new(),
    )
    .await?;

    let call = |body: &'static str| {
        let client = client.clone();
        async move {
            client
                .call(Message::raw(MsgId::new(1, 1), body.as_bytes().to_vec()))
                .await
        }
    };
    // The slowest handler answers last, so replies arrive out of call order.
    let (slow, fast, medium) = tokio::join!(call("100"), call("10"), call("50"));
    assert_eq!(slow?.body(), b"100");
    assert_eq!(fast?.body(), b"10");
    assert_eq!(medium?.body(), b"50");

    assert_eq!(client.pending_calls(), 0);
    client.close();
    server.close();
    Ok(())
}

/// A request frame without a sequence number must be answered with a reply
/// carrying the check failure in `msg_err` and an empty body.
#[tokio::test]
async fn malformed_request_gets_an_error_reply() -> Result<()> {
    init_logging();

    let mut router = Router::new();
    router.register_handler(1, 1, |ctx: &mut Context| {
        let _ = ctx.raw(ctx.msg_id(), b"should not run".to_vec(), None);
    });
    let server = Server::new(ConnConfig::new(), router);
    let accept = server.clone();
    tokio::spawn(async move { accept.listen_and_serve("127.0.0.1:18312").await });
    sleep(Duration::from_millis(100)).await;

    // Craft the malformed frame by hand; the client API always sets a seq.
    let mut bad = Message::raw(MsgId::new(1, 1), b"payload".to_vec());
    bad.set_msg_type(MsgType::Request);
    let frame = RawProto.pack(&bad)?;

    let mut stream = TcpStream::connect("127.0.0.1:18312").await?;
    stream.write_all(&frame).await?;

    let mut len = [0u8; LEN_PREFIX_SIZE];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut len)).await??;
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize - LEN_PREFIX_SIZE];
    stream.read_exact(&mut body).await?;
    let reply = RawProto.unpack(&body)?;

    assert_eq!(reply.msg_type(), Some(MsgType::Reply));
    assert_eq!(reply.remote_err(), Some("msg seq is empty"));
    assert!(reply.body().is_empty());

    server.close();
    Ok(())
}

/// A remote handler that sets `msg_err` on its reply surfaces as
/// `RpcError::Remote` on the calling side, text intact.
#[tokio::test]
async fn remote_errors_propagate_to_the_caller() -> Result<()> {
    init_logging();

    let mut router = Router::new();
    router.register_handler(3, 1, |ctx: &mut Context| {
        let mut md = std::collections::HashMap::new();
        md.insert("msg_err".to_string(), "tea pot overflow".to_string());
        let _ = ctx.raw(ctx.msg_id(), Vec::new(), Some(md));
    });
    let server = Server::new(ConnConfig::new(), router);
    let accept = server.clone();
    tokio::spawn(async move { accept.listen_and_serve("127.0.0.1:18314").await });
    sleep(Duration::from_millis(100)).await;

    let client = Client::dial(
        ConnConfig::new().with_addr("127.0.0.1:18314"),
        Router::new(),
    )
    .await?;

    let err = client
        .call(Message::raw(MsgId::new(3, 1), Vec::new()))
        .await
        .expect_err("reply carries msg_err");
    match err {
        RpcError::Remote(text) => assert_eq!(text, "tea pot overflow"),
        other => panic!("expected a remote error, got {other}"),
    }
    assert_eq!(client.pending_calls(), 0);

    client.close();
    server.close();
    Ok(())
}

/// A header beyond the 4095-byte wire limit fails the call locally before
/// any frame is sent, and the pending table does not leak the entry.
#[tokio::test]
async fn oversized_header_fails_without_leaking_pending_entries() -> Result<()> {
    init_logging();
    let server = spawn_echo_after_delay_server("127.0.0.1:18313").await;

    let client = Client::dial(
        ConnConfig::new().with_addr("127.0.0.1:18313"),
        Router::new(),
    )
    .await?;

    let mut msg = Message::raw(MsgId::new(1, 1), b"0".to_vec());
    msg.set_header("blob", "x".repeat(5000));
    let err = client.call(msg).await.expect_err("header exceeds the limit");
    assert!(matches!(err, RpcError::HeaderTooLong));
    assert_eq!(client.pending_calls(), 0);

    // The connection is still usable afterwards.
    let reply = client
        .call(Message::raw(MsgId::new(1, 1), b"0".to_vec()))
        .await?;
    assert_eq!(reply.body(), b"0");

    client.close();
    server.close();
    Ok(())
}

/// Aborting global middleware must yield `MessageNotSent` and clean up.
#[tokio::test]
async fn aborted_middleware_yields_message_not_sent() -> Result<()> {
    init_logging();
    let server = spawn_echo_after_delay_server("127.0.0.1:18315").await;

    let mut client_router = Router::new();
    client_router.register_global_middleware(|ctx: &mut Context| ctx.abort());
    let client = Client::dial(
        ConnConfig::new().with_addr("127.0.0.1:18315"),
        client_router,
    )
    .await?;

    let err = client
        .call(Message::raw(MsgId::new(1, 1), b"0".to_vec()))
        .await
        .expect_err("middleware aborts before the send step");
    assert!(matches!(err, RpcError::MessageNotSent));
    assert_eq!(client.pending_calls(), 0);

    client.close();
    server.close();
    Ok(())
}
