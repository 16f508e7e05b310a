//! End-to-end relay tests over a real WebSocket connection.

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use veil_protocol::{codec, ClientEvent, Envelope, ServerEvent};
use veil_server::{build_app, AppState, Config};

async fn start_server() -> SocketAddr {
    let mut config = Config::default();
    config.metrics.enabled = false;

    let state = Arc::new(AppState::new(config));
    let app = build_app(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        Self {
            ws,
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, event: &ClientEvent) {
        let data = codec::encode(event).unwrap();
        self.ws.send(Message::Binary(data.to_vec())).await.unwrap();
    }

    async fn register(&mut self, user_id: &str) {
        self.send(&ClientEvent::Register {
            user_id: user_id.to_string(),
            public_key: format!("pk-{user_id}"),
        })
        .await;

        let event = self.next_event().await;
        assert!(
            matches!(&event, ServerEvent::Registered { success: true, user_id: id, .. } if id == user_id),
            "unexpected registration reply: {event:?}"
        );
    }

    async fn next_event(&mut self) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(event) = codec::decode_from::<ServerEvent>(&mut self.buf).unwrap() {
                    return event;
                }
                match self.ws.next().await {
                    Some(Ok(Message::Binary(data))) => self.buf.extend_from_slice(&data),
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended while waiting for event: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_for(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }
}

fn envelope(from: &str, to: &str, message_id: &str) -> Envelope {
    Envelope {
        from: from.to_string(),
        to: to.to_string(),
        cipher: "ciphertext".to_string(),
        kri_key: "wrapped-key".to_string(),
        harmony: 34,
        timestamp: 1_700_000_000_000,
        nonce: "nonce".to_string(),
        message_id: Some(message_id.to_string()),
        group_id: None,
    }
}

#[tokio::test]
async fn test_message_roundtrip_between_two_clients() {
    let addr = start_server().await;

    let mut alice = TestClient::connect(addr).await;
    alice.register("alice").await;

    let mut bob = TestClient::connect(addr).await;
    bob.register("bob").await;

    // Alice learns that Bob came online.
    let online = alice
        .wait_for(|e| matches!(e, ServerEvent::UserOnline { .. }))
        .await;
    assert!(matches!(&online, ServerEvent::UserOnline { user_id, .. } if user_id == "bob"));

    alice
        .send(&ClientEvent::MessageSend(envelope("alice", "bob", "m1")))
        .await;

    let received = bob
        .wait_for(|e| matches!(e, ServerEvent::MessageReceive(_)))
        .await;
    let ServerEvent::MessageReceive(delivery) = received else {
        unreachable!();
    };
    assert_eq!(delivery.from, "alice");
    assert_eq!(delivery.cipher, "ciphertext");
    assert_eq!(delivery.message_id.as_deref(), Some("m1"));

    let confirmed = alice
        .wait_for(|e| matches!(e, ServerEvent::MessageDelivered { .. }))
        .await;
    assert!(matches!(
        &confirmed,
        ServerEvent::MessageDelivered { message_id, to, .. } if message_id == "m1" && to == "bob"
    ));
}

#[tokio::test]
async fn test_unknown_recipient_errors_sender_only() {
    let addr = start_server().await;

    let mut alice = TestClient::connect(addr).await;
    alice.register("alice").await;

    alice
        .send(&ClientEvent::MessageSend(envelope("alice", "carol", "m1")))
        .await;

    let error = alice
        .wait_for(|e| matches!(e, ServerEvent::MessageError { .. }))
        .await;
    assert!(matches!(&error, ServerEvent::MessageError { to, .. } if to == "carol"));
}

#[tokio::test]
async fn test_disconnect_broadcasts_offline() {
    let addr = start_server().await;

    let mut alice = TestClient::connect(addr).await;
    alice.register("alice").await;

    let mut bob = TestClient::connect(addr).await;
    bob.register("bob").await;

    drop(bob);

    let offline = alice
        .wait_for(|e| matches!(e, ServerEvent::UserOffline { .. }))
        .await;
    assert!(matches!(&offline, ServerEvent::UserOffline { user_id } if user_id == "bob"));
}
