use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::time::sleep;
use weft::{Client, ConnConfig, Context, Message, MsgId, Router, Server};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn echo_server() -> Server {
    let mut router = Router::new();
    router.register_handler(1, 1, |ctx: &mut Context| {
        let _ = ctx.raw(ctx.msg_id(), ctx.raw_data().to_vec(), None);
    });
    Server::new(ConnConfig::new(), router)
}

/// Kill the server mid-session, restart a listener on the same port, and
/// verify the client's auto-reconnect restores service within the backoff
/// window.
#[tokio::test]
async fn reconnect_resumes_service_after_server_restart() -> Result<()> {
    init_logging();
    const ADDR: &str = "127.0.0.1:18321";

    let first = echo_server();
    let accept = first.clone();
    tokio::spawn(async move { accept.listen_and_serve(ADDR).await });
    sleep(Duration::from_millis(100)).await;

    let client = Client::dial(ConnConfig::new().with_addr(ADDR), Router::new()).await?;
    let reply = client
        .call(Message::raw(MsgId::new(1, 1), b"before".to_vec()))
        .await?;
    assert_eq!(reply.body(), b"before");

    // Drop the server and give its listener time to go away.
    first.close();
    sleep(Duration::from_millis(200)).await;

    let second = echo_server();
    let accept = second.clone();
    tokio::spawn(async move { accept.listen_and_serve(ADDR).await });

    // The supervisor backs off from 10 ms; well before the attempt limit
    // runs out a call must succeed again.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut reconnected = false;
    while Instant::now() < deadline {
        match client
            .call(Message::raw(MsgId::new(1, 1), b"after".to_vec()))
            .await
        {
            Ok(reply) => {
                assert_eq!(reply.body(), b"after");
                reconnected = true;
                break;
            }
            Err(_) => sleep(Duration::from_millis(100)).await,
        }
    }
    assert!(reconnected, "client did not reconnect within the window");
    assert!(!client.is_closed());

    client.close();
    second.close();
    Ok(())
}

/// With reconnection disabled, a lost connection closes the client.
#[tokio::test]
async fn connection_loss_without_reconnection_closes_the_client() -> Result<()> {
    init_logging();
    const ADDR: &str = "127.0.0.1:18323";

    let server = echo_server();
    let accept = server.clone();
    tokio::spawn(async move { accept.listen_and_serve(ADDR).await });
    sleep(Duration::from_millis(100)).await;

    let client = Client::dial(
        ConnConfig::new().with_addr(ADDR).with_reconnection(false),
        Router::new(),
    )
    .await?;

    server.close();
    let deadline = Instant::now() + Duration::from_secs(2);
    while !client.is_closed() && Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }
    assert!(client.is_closed());
    Ok(())
}

/// A client with the heartbeat ticker enabled delivers keepalives that the
/// server routes like any other message.
#[tokio::test]
async fn heartbeats_reach_a_registered_handler() -> Result<()> {
    init_logging();
    const ADDR: &str = "127.0.0.1:18322";

    let beats = Arc::new(AtomicUsize::new(0));
    let seen = beats.clone();
    let mut router = Router::new();
    // Heartbeats carry the unspecified id (0, 0).
    router.register_handler(0, 0, move |_ctx: &mut Context| {
        seen.fetch_add(1, Ordering::Relaxed);
    });
    let server = Server::new(ConnConfig::new(), router);
    let accept = server.clone();
    tokio::spawn(async move { accept.listen_and_serve(ADDR).await });
    sleep(Duration::from_millis(100)).await;

    let client = Client::dial(
        ConnConfig::new()
            .with_addr(ADDR)
            .with_heartbeat(Duration::from_millis(50)),
        Router::new(),
    )
    .await?;

    sleep(Duration::from_millis(400)).await;
    assert!(beats.load(Ordering::Relaxed) >= 2);

    client.close();
    server.close();
    Ok(())
}
