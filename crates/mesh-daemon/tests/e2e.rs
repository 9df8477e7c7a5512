//! End-to-end tests for mesh-daemon.
//!
//! Runs a real relay on a loopback port and drives raw WebSocket clients
//! and full engines against it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mesh_core::{
    CarrierError, ChannelInfo, ChannelPolicy, Destination, EngineConfig, EventLog, MeshEngine,
    MeshEvent, MeshId, SystemClock,
};
use mesh_daemon::{RelayFrame, RelayServer, WebSocketCarrier};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Peer = MeshEngine<WebSocketCarrier, EventLog>;

/// Raw relay client speaking frames directly.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");
        Self { ws }
    }

    async fn send(&mut self, frame: RelayFrame) {
        let data = frame.to_binary().expect("Failed to encode frame");
        self.ws
            .send(Message::Binary(data.into()))
            .await
            .expect("Failed to send frame");
    }

    async fn recv_frame(&mut self) -> RelayFrame {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return RelayFrame::from_binary(&data).expect("Expected relay frame");
                }
                Some(Ok(Message::Text(text))) => {
                    return RelayFrame::from_binary(text.as_bytes()).expect("Expected relay frame");
                }
                Some(Ok(Message::Close(_))) => panic!("Connection closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {}", e),
                None => panic!("Stream ended unexpectedly"),
                _ => continue,
            }
        }
    }

    async fn recv_frame_timeout(&mut self, duration: Duration) -> Option<RelayFrame> {
        timeout(duration, self.recv_frame()).await.ok()
    }

    /// Subscribe and wait until the relay has applied it, using our own echo.
    async fn subscribe_confirmed(&mut self, topic: MeshId) {
        self.send(RelayFrame::Subscribe { topic }).await;
        self.send(RelayFrame::Publish {
            topic,
            data: "marker".to_string(),
        })
        .await;
        let echo = self
            .recv_frame_timeout(Duration::from_secs(2))
            .await
            .expect("Expected marker echo");
        assert_eq!(
            echo,
            RelayFrame::Deliver {
                topic,
                data: "marker".to_string()
            }
        );
    }
}

/// Start a relay on a free loopback port.
async fn start_relay() -> SocketAddr {
    let listener = RelayServer::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(RelayServer::new().serve(listener));
    addr
}

fn fast_policy() -> ChannelPolicy {
    ChannelPolicy {
        drop_ms: 2_000,
        ping_ms: 200,
        missing_ms: 1_000,
        sync_ms: 300,
        max_peers: 0,
    }
}

async fn start_peer(addr: SocketAddr, address: &str) -> Peer {
    let carrier = WebSocketCarrier::connect(&format!("ws://{}", addr))
        .await
        .expect("Failed to connect carrier");
    let mut engine = MeshEngine::new(
        EngineConfig::with_address(address),
        Arc::new(SystemClock),
        carrier,
        EventLog::new(),
    );
    engine
        .join(ChannelInfo::new("lobby", fast_policy()), format!("hello from {}", address))
        .expect("Failed to join");
    engine
}

/// Update every peer on a short tick until `done` holds or five seconds pass.
async fn settle(peers: &mut [&mut Peer], done: impl Fn(&[&mut Peer]) -> bool) -> bool {
    timeout(Duration::from_secs(5), async {
        loop {
            for peer in peers.iter_mut() {
                peer.update();
            }
            if done(peers) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

fn lobby() -> MeshId {
    MeshId::for_name("lobby")
}

// ==================== Relay ====================

#[tokio::test]
async fn test_relay_delivers_to_subscribers_only() {
    let addr = start_relay().await;
    let topic = MeshId::for_name("room");

    let mut listener = TestClient::connect(addr).await;
    let mut publisher = TestClient::connect(addr).await;
    listener.subscribe_confirmed(topic).await;

    publisher
        .send(RelayFrame::Publish {
            topic,
            data: "hi".to_string(),
        })
        .await;

    let frame = listener
        .recv_frame_timeout(Duration::from_secs(2))
        .await
        .expect("Listener should receive delivery");
    assert_eq!(
        frame,
        RelayFrame::Deliver {
            topic,
            data: "hi".to_string()
        }
    );

    // Publisher never subscribed, so nothing comes back to it
    assert!(
        publisher
            .recv_frame_timeout(Duration::from_millis(300))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn test_relay_stops_after_unsubscribe() {
    let addr = start_relay().await;
    let topic = MeshId::for_name("room");
    let other = MeshId::for_name("other");

    let mut client = TestClient::connect(addr).await;
    client.subscribe_confirmed(topic).await;
    client.send(RelayFrame::Unsubscribe { topic }).await;
    client
        .send(RelayFrame::Publish {
            topic,
            data: "after".to_string(),
        })
        .await;

    // A second topic proves the relay has processed everything sent before it
    client.subscribe_confirmed(other).await;
    assert!(
        client
            .recv_frame_timeout(Duration::from_millis(300))
            .await
            .is_none()
    );
}

// ==================== Carrier ====================

#[tokio::test]
async fn test_connect_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = WebSocketCarrier::connect(&format!("ws://{}", addr)).await;
    assert!(matches!(result, Err(CarrierError::ConnectionFailed(_))));
}

#[tokio::test]
async fn test_invalid_endpoint() {
    let result = WebSocketCarrier::connect("tcp://127.0.0.1:9400").await;
    assert!(matches!(result, Err(CarrierError::InvalidEndpoint(_))));
}

// ==================== Mesh over relay ====================

#[tokio::test]
async fn test_peers_discover_each_other() {
    let addr = start_relay().await;
    let mut alice = start_peer(addr, "alice").await;
    let mut bob = start_peer(addr, "bob").await;

    let joined = settle(&mut [&mut alice, &mut bob], |peers| {
        peers[0].peer_addresses(lobby()) == ["bob"] && peers[1].peer_addresses(lobby()) == ["alice"]
    })
    .await;
    assert!(joined, "Peers should see each other");

    assert_eq!(alice.peer_hello_data(lobby(), "bob"), Some("hello from bob"));
    let joins = alice
        .client()
        .events()
        .iter()
        .filter(|e| matches!(e, MeshEvent::PeerJoined { address, .. } if address == "bob"))
        .count();
    assert_eq!(joins, 1);
}

#[tokio::test]
async fn test_direct_message_over_relay() {
    let addr = start_relay().await;
    let mut alice = start_peer(addr, "alice").await;
    let mut bob = start_peer(addr, "bob").await;

    assert!(
        settle(&mut [&mut alice, &mut bob], |peers| {
            !peers[0].peer_addresses(lobby()).is_empty() && !peers[1].peer_addresses(lobby()).is_empty()
        })
        .await
    );

    alice
        .send(Destination::Address("bob".to_string()), "hi bob")
        .expect("Send should succeed");

    let delivered = settle(&mut [&mut alice, &mut bob], |peers| {
        peers[1].client().events().iter().any(|e| {
            matches!(e, MeshEvent::ClientMessage { from_address, payload, .. }
                if from_address == "alice" && payload == "hi bob")
        })
    })
    .await;
    assert!(delivered, "Bob should receive the direct message");
}

#[tokio::test]
async fn test_leave_is_reported() {
    let addr = start_relay().await;
    let mut alice = start_peer(addr, "alice").await;
    let mut bob = start_peer(addr, "bob").await;

    assert!(
        settle(&mut [&mut alice, &mut bob], |peers| {
            !peers[0].peer_addresses(lobby()).is_empty() && !peers[1].peer_addresses(lobby()).is_empty()
        })
        .await
    );

    bob.leave();

    let left = settle(&mut [&mut alice], |peers| {
        peers[0].client().events().iter().any(|e| {
            matches!(e, MeshEvent::PeerLeft { address, .. } if address == "bob")
        })
    })
    .await;
    assert!(left, "Alice should see Bob leave");
    assert!(alice.peer_addresses(lobby()).is_empty());
}
