//! Test utilities and common setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use karatu_signal::api::{self, AppState, CorsConfig};
use karatu_signal::relay::RelayRegistry;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn a relay server on an ephemeral port.
pub async fn spawn_relay() -> (SocketAddr, Arc<RelayRegistry>) {
    spawn_relay_with_origins(Vec::new()).await
}

/// Spawn a relay restricted to the given browser origins.
pub async fn spawn_relay_with_origins(
    allowed_origins: Vec<String>,
) -> (SocketAddr, Arc<RelayRegistry>) {
    let registry = Arc::new(RelayRegistry::new());
    let state = AppState::new(registry.clone(), CorsConfig { allowed_origins });
    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, registry)
}

/// A WebSocket client for driving the relay in tests.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub peer_id: String,
}

impl TestClient {
    /// Connect and consume the `connected` handshake frame.
    pub async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let mut client = Self {
            ws,
            peer_id: String::new(),
        };
        let hello = client.recv().await;
        assert_eq!(hello["type"], "connected");
        client.peer_id = hello["peerId"].as_str().unwrap().to_string();
        client
    }

    pub async fn send(&mut self, frame: Value) {
        self.ws
            .send(Message::text(frame.to_string()))
            .await
            .unwrap();
    }

    /// Send an arbitrary text frame, bypassing JSON construction.
    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::text(text)).await.unwrap();
    }

    /// Next JSON frame, skipping transport-level ping/pong.
    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                match self.ws.next().await.expect("connection closed").unwrap() {
                    Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for frame")
    }

    /// Assert that no JSON frame arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let got = tokio::time::timeout(window, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
                    Some(Ok(_)) => continue,
                    // A closed or failed socket also delivered nothing; park
                    // until the window elapses.
                    Some(Err(_)) | None => {
                        std::future::pending::<()>().await;
                        unreachable!()
                    }
                }
            }
        })
        .await;
        if let Ok(frame) = got {
            panic!("expected silence, got: {frame}");
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
