use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use livestyle::protocol::{Envelope, SERVER_ID};
use livestyle::server::RelayServer;
use serde_json::json;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn ws_client(addr: SocketAddr) -> Ws {
    let url = format!("ws://{}/livestyle", addr);
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.expect("ws connect");
    ws
}

async fn send_env(ws: &mut Ws, name: &str, data: serde_json::Value) {
    let frame = Envelope::new(name, data).encode().unwrap();
    ws.send(Message::Text(frame.into())).await.unwrap();
}

/// Receive frames until one named `name` arrives or `wait` elapses.
async fn recv_named(ws: &mut Ws, name: &str, wait: Duration) -> Option<Envelope> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(env) = Envelope::decode(&text.to_string()) {
                    if env.name == name {
                        return Some(env);
                    }
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Ok(None) => return None,
            Err(_) => return None,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_connect_announced_to_peers() {
    let relay = RelayServer::new(0);
    let addr = relay.start().await.unwrap();

    let mut a = ws_client(addr).await;
    let _b = ws_client(addr).await;

    let env = recv_named(&mut a, "client-connect", Duration::from_secs(2)).await;
    assert!(env.is_some(), "existing peer was not told about the newcomer");

    relay.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calculate_diff_reaches_patchers_only() {
    let relay = RelayServer::new(0);
    let addr = relay.start().await.unwrap();

    let mut editor = ws_client(addr).await;
    let mut patcher = ws_client(addr).await;
    let mut generic = ws_client(addr).await;

    send_env(&mut editor, "editor-connect", json!({"id": "atom"})).await;
    send_env(&mut patcher, "patcher-connect", json!({})).await;
    sleep(Duration::from_millis(100)).await;

    send_env(&mut editor, "calculate-diff", json!({"uri": "f.css"})).await;

    let received = recv_named(&mut patcher, "calculate-diff", Duration::from_secs(2)).await;
    assert!(received.is_some(), "patcher did not receive calculate-diff");
    assert_eq!(received.unwrap().data.unwrap()["uri"], "f.css");

    assert!(
        recv_named(&mut generic, "calculate-diff", Duration::from_millis(300))
            .await
            .is_none(),
        "generic client received a patchers-only message"
    );
    assert!(
        recv_named(&mut editor, "calculate-diff", Duration::from_millis(300))
            .await
            .is_none(),
        "sender received its own message back"
    );

    relay.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_reaches_everyone_but_sender() {
    let relay = RelayServer::new(0);
    let addr = relay.start().await.unwrap();

    let mut a = ws_client(addr).await;
    let mut b = ws_client(addr).await;
    let mut c = ws_client(addr).await;
    sleep(Duration::from_millis(100)).await;

    send_env(&mut a, "identify-client", json!({"id": "someone"})).await;

    assert!(recv_named(&mut b, "identify-client", Duration::from_secs(2)).await.is_some());
    assert!(recv_named(&mut c, "identify-client", Duration::from_secs(2)).await.is_some());
    assert!(
        recv_named(&mut a, "identify-client", Duration::from_millis(300)).await.is_none(),
        "sender received its own broadcast"
    );

    relay.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnecting_editor_replaces_stale_entry() {
    let relay = RelayServer::new(0);
    let addr = relay.start().await.unwrap();

    let mut observer = ws_client(addr).await;
    let mut stale = ws_client(addr).await;
    send_env(&mut stale, "editor-connect", json!({"id": "atom"})).await;
    sleep(Duration::from_millis(100)).await;

    // Same id, new connection: silently takes over the registration.
    let mut fresh = ws_client(addr).await;
    send_env(&mut fresh, "editor-connect", json!({"id": "atom"})).await;
    sleep(Duration::from_millis(100)).await;

    stale.close(None).await.unwrap();
    assert!(
        recv_named(&mut observer, "editor-disconnect", Duration::from_millis(400))
            .await
            .is_none(),
        "stale connection close announced an id owned by the new connection"
    );

    fresh.close(None).await.unwrap();
    let gone = recv_named(&mut observer, "editor-disconnect", Duration::from_secs(2)).await;
    assert!(gone.is_some(), "editor close was not announced");
    assert_eq!(gone.unwrap().data.unwrap()["id"], "atom");

    relay.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frames_are_dropped_not_fatal() {
    let relay = RelayServer::new(0);
    let addr = relay.start().await.unwrap();

    let mut a = ws_client(addr).await;
    let mut b = ws_client(addr).await;
    sleep(Duration::from_millis(100)).await;

    a.send(Message::Text("not json at all".to_string().into()))
        .await
        .unwrap();
    send_env(&mut a, "identify-client", json!({})).await;

    assert!(
        recv_named(&mut b, "identify-client", Duration::from_secs(2)).await.is_some(),
        "relay stopped relaying after a malformed frame"
    );

    relay.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_http_answers_with_server_id() {
    let relay = RelayServer::new(0);
    let addr = relay.start().await.unwrap();

    let body = reqwest::get(format!("http://{}/", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, SERVER_ID);

    // Any path, as long as it is not an upgrade.
    let body = reqwest::get(format!("http://{}/anything", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, SERVER_ID);

    relay.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upgrade_outside_accept_path_rejected() {
    let relay = RelayServer::new(0);
    let addr = relay.start().await.unwrap();

    let refused =
        tokio_tungstenite::connect_async(format!("ws://{}/other", addr)).await;
    assert!(refused.is_err(), "upgrade accepted outside /livestyle");

    let trailing =
        tokio_tungstenite::connect_async(format!("ws://{}/livestyle/", addr)).await;
    assert!(trailing.is_ok(), "trailing slash upgrade rejected");

    relay.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_is_idempotent_and_destroy_is_safe() {
    let relay = RelayServer::new(0);

    // Safe when nothing is running.
    relay.destroy().await;

    let first = relay.start().await.unwrap();
    let second = relay.start().await.unwrap();
    assert_eq!(first, second, "second start created a new listener");

    relay.destroy().await;
    assert!(!relay.is_running().await);

    // The instance can serve again after destroy.
    relay.start().await.unwrap();
    relay.destroy().await;
}
