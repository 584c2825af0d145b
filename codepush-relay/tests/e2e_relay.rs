use std::time::Duration;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use codepush_relay::{AppState, build_router};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tower::ServiceExt;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestRelay {
    address: String,
    state: AppState,
    shutdown_tx: oneshot::Sender<()>,
}

impl TestRelay {
    async fn post(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = build_router(self.state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("build request"),
            )
            .await
            .expect("route request");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 64 * 1024)
            .await
            .expect("read body");
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    /// Registers `username` and returns a fresh access token.
    async fn login(&self, username: &str) -> String {
        let credentials = serde_json::json!({"username": username, "password": "hunter2"});
        let (status, _) = self.post("/register", credentials.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = self.post("/login", credentials).await;
        assert_eq!(status, StatusCode::OK);
        body["access_token"]
            .as_str()
            .expect("access token")
            .to_owned()
    }

    async fn push(&self, username: &str, body: serde_json::Value) -> serde_json::Value {
        let (status, body) = self.post(&format!("/push/{username}"), body).await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    async fn wait_for_clients(&self, username: &str, expected: &[&str]) {
        timeout(Duration::from_secs(2), async {
            loop {
                let clients = self.state.connected_clients(username).await;
                if clients.iter().map(String::as_str).eq(expected.iter().copied()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connected clients reach expected set");
    }

    fn channel_url(&self, device_id: &str, token: &str) -> String {
        format!("ws://{}/ws/{}?token={}", self.address, device_id, token)
    }

    fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[tokio::test]
async fn pushed_code_reaches_connected_client() {
    let relay = start_relay().await;
    let token = relay.login("alice").await;

    let mut client = connect_client(&relay.channel_url("dev_a", &token)).await;
    relay.wait_for_clients("alice", &["dev_a"]).await;

    let body = relay
        .push("alice", serde_json::json!({"code": "123456"}))
        .await;
    assert_eq!(body["status"], "success");

    let text = recv_text(&mut client, Duration::from_secs(2))
        .await
        .expect("client receives code");
    assert_eq!(text, r#"{"type":"VERIFICATION_CODE","code":"123456"}"#);

    relay.shutdown();
}

#[tokio::test]
async fn invalid_token_is_rejected_before_upgrade() {
    let relay = start_relay().await;
    relay.login("bob").await;

    let err = connect_async(relay.channel_url("dev_b", "not-a-token"))
        .await
        .expect_err("handshake must fail");
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        other => panic!("unexpected handshake error: {other}"),
    }
    assert!(relay.state.connected_clients("bob").await.is_empty());

    relay.shutdown();
}

#[tokio::test]
async fn device_id_targets_one_client_and_falls_back_to_all() {
    let relay = start_relay().await;
    let token = relay.login("carol").await;

    let mut laptop = connect_client(&relay.channel_url("dev_laptop", &token)).await;
    let mut desktop = connect_client(&relay.channel_url("dev_desktop", &token)).await;
    relay
        .wait_for_clients("carol", &["dev_desktop", "dev_laptop"])
        .await;

    relay
        .push(
            "carol",
            serde_json::json!({"code": "1111", "device_id": "dev_desktop"}),
        )
        .await;
    let received = recv_text(&mut desktop, Duration::from_secs(2)).await;
    assert!(received.is_some_and(|text| text.contains("1111")));
    assert!(
        recv_text(&mut laptop, Duration::from_millis(300))
            .await
            .is_none(),
        "untargeted client received the code"
    );

    relay
        .push(
            "carol",
            serde_json::json!({"code": "2222", "device_id": "dev_offline"}),
        )
        .await;
    for client in [&mut laptop, &mut desktop] {
        let received = recv_text(client, Duration::from_secs(2)).await;
        assert!(received.is_some_and(|text| text.contains("2222")));
    }

    relay.shutdown();
}

#[tokio::test]
async fn client_pings_and_unknown_frames_keep_channel_open() {
    let relay = start_relay().await;
    let token = relay.login("dave").await;

    let mut client = connect_client(&relay.channel_url("dev_d", &token)).await;
    relay.wait_for_clients("dave", &["dev_d"]).await;

    for frame in [r#"{"type":"PING"}"#, r#"{"type":"UNKNOWN"}"#, "not json"] {
        client
            .send(Message::Text(frame.into()))
            .await
            .expect("send frame");
    }

    relay
        .push("dave", serde_json::json!({"code": "3333"}))
        .await;
    let received = recv_text(&mut client, Duration::from_secs(2)).await;
    assert!(received.is_some_and(|text| text.contains("3333")));

    relay.shutdown();
}

#[tokio::test]
async fn reconnect_with_same_client_id_replaces_earlier_channel() {
    let relay = start_relay().await;
    let token = relay.login("erin").await;

    let mut first = connect_client(&relay.channel_url("dev_e", &token)).await;
    relay.wait_for_clients("erin", &["dev_e"]).await;
    let mut second = connect_client(&relay.channel_url("dev_e", &token)).await;

    let closed = timeout(Duration::from_secs(2), async {
        while let Some(Ok(message)) = first.next().await {
            if matches!(message, Message::Close(_)) {
                return true;
            }
        }
        true
    })
    .await
    .expect("earlier channel is closed");
    assert!(closed);

    // The earlier channel going away must not unregister its replacement.
    tokio::time::sleep(Duration::from_millis(100)).await;
    relay.wait_for_clients("erin", &["dev_e"]).await;

    relay
        .push("erin", serde_json::json!({"code": "4444"}))
        .await;
    let received = recv_text(&mut second, Duration::from_secs(2)).await;
    assert!(received.is_some_and(|text| text.contains("4444")));

    relay.shutdown();
}

#[tokio::test]
async fn closed_channel_is_unregistered() {
    let relay = start_relay().await;
    let token = relay.login("frank").await;

    let mut client = connect_client(&relay.channel_url("dev_f", &token)).await;
    relay.wait_for_clients("frank", &["dev_f"]).await;
    client.close(None).await.expect("close channel");
    relay.wait_for_clients("frank", &[]).await;

    let body = relay
        .push("frank", serde_json::json!({"code": "5555"}))
        .await;
    assert_eq!(body["status"], "error");

    relay.shutdown();
}

async fn start_relay() -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral relay socket");
    let address = listener.local_addr().expect("relay local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let state = AppState::with_password_cost(4);

    let server = axum::serve(listener, build_router(state.clone())).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    TestRelay {
        address: address.to_string(),
        state,
        shutdown_tx,
    }
}

async fn connect_client(url: &str) -> WsStream {
    let (ws_stream, _) = connect_async(url).await.expect("connect websocket");
    ws_stream
}

async fn recv_text(client: &mut WsStream, wait: Duration) -> Option<String> {
    timeout(wait, async {
        while let Some(message) = client.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
