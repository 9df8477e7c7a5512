//! WebSocket topic relay.
//!
//! Clients subscribe to topics (channel ids and peer ids) and publish
//! opaque payloads. Every publish is delivered to all current subscribers
//! of its topic, the publisher included.

use crate::connection::{ConnectionEvent, RelayConnection};
use crate::frame::RelayFrame;
use anyhow::Result;
use mesh_core::MeshId;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

pub struct RelayServer {
    connections: HashMap<u64, RelayConnection>,
    /// Topic -> subscribed connection ids
    subscriptions: HashMap<MeshId, BTreeSet<u64>>,
    next_conn_id: u64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            connections: HashMap::new(),
            subscriptions: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Upgrade an incoming TCP connection to WebSocket and start reading it.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and close without finishing the upgrade
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before upgrade from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        info!("New connection from {} (conn-{})", addr, conn_id);

        let conn = RelayConnection::new(conn_id, ws_stream, self.event_tx.clone());
        self.connections.insert(conn_id, conn);
    }

    /// Wait for the next connection event.
    pub async fn recv_event(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Apply one connection event to the subscription table.
    pub async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame { conn_id, frame } => self.on_frame(conn_id, frame).await,
            ConnectionEvent::Closed { conn_id } => {
                self.connections.remove(&conn_id);
                self.subscriptions.retain(|_, subscribers| {
                    subscribers.remove(&conn_id);
                    !subscribers.is_empty()
                });
                info!("Connection conn-{} closed", conn_id);
            }
        }
    }

    async fn on_frame(&mut self, conn_id: u64, frame: RelayFrame) {
        match frame {
            RelayFrame::Subscribe { topic } => {
                self.subscriptions.entry(topic).or_default().insert(conn_id);
                debug!("conn-{} subscribed to {}", conn_id, topic);
            }
            RelayFrame::Unsubscribe { topic } => {
                if let Some(subscribers) = self.subscriptions.get_mut(&topic) {
                    subscribers.remove(&conn_id);
                    if subscribers.is_empty() {
                        self.subscriptions.remove(&topic);
                    }
                }
                debug!("conn-{} unsubscribed from {}", conn_id, topic);
            }
            RelayFrame::Publish { topic, data } => {
                self.deliver(topic, data).await;
            }
            RelayFrame::Deliver { topic, .. } => {
                warn!("conn-{} sent a deliver frame for {}, ignoring", conn_id, topic);
            }
        }
    }

    async fn deliver(&self, topic: MeshId, data: String) {
        let Some(subscribers) = self.subscriptions.get(&topic) else {
            debug!("No subscribers for {}, dropping publish", topic);
            return;
        };
        let frame = RelayFrame::Deliver { topic, data };
        for conn_id in subscribers {
            let Some(conn) = self.connections.get(conn_id) else {
                continue;
            };
            if let Err(e) = conn.send(&frame).await {
                warn!("Failed to deliver to conn-{}: {}", conn_id, e);
            }
        }
    }

    /// Accept connections and route frames forever.
    pub async fn serve(mut self, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept_connection(stream, addr).await,
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }
            }
        }
    }

    /// Close every client connection.
    pub async fn shutdown(&mut self) {
        for conn in self.connections.values_mut() {
            conn.close().await;
        }
        self.connections.clear();
        self.subscriptions.clear();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscriber_count(&self, topic: MeshId) -> usize {
        self.subscriptions.get(&topic).map_or(0, BTreeSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_relay_is_empty() {
        let relay = RelayServer::new();
        assert_eq!(relay.connection_count(), 0);
        assert_eq!(relay.subscriber_count(MeshId::for_name("lobby")), 0);
    }

    #[tokio::test]
    async fn test_subscription_table() {
        let mut relay = RelayServer::new();
        let topic = MeshId::for_name("lobby");

        relay
            .handle_event(ConnectionEvent::Frame {
                conn_id: 7,
                frame: RelayFrame::Subscribe { topic },
            })
            .await;
        relay
            .handle_event(ConnectionEvent::Frame {
                conn_id: 8,
                frame: RelayFrame::Subscribe { topic },
            })
            .await;
        assert_eq!(relay.subscriber_count(topic), 2);

        relay
            .handle_event(ConnectionEvent::Frame {
                conn_id: 7,
                frame: RelayFrame::Unsubscribe { topic },
            })
            .await;
        assert_eq!(relay.subscriber_count(topic), 1);

        relay.handle_event(ConnectionEvent::Closed { conn_id: 8 }).await;
        assert_eq!(relay.subscriber_count(topic), 0);
    }
}
