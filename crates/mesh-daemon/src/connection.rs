//! A relay client connection.
//!
//! Each connection wraps an accepted WebSocket stream. A read task parses
//! incoming frames and forwards them to the relay's event channel; writes go
//! through the shared sink half.

use crate::frame::{MAX_FRAME_SIZE, RelayFrame};
use anyhow::{Result, anyhow};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A well-formed frame arrived
    Frame { conn_id: u64, frame: RelayFrame },
    /// Connection was closed
    Closed { conn_id: u64 },
}

/// One WebSocket client of the relay.
pub struct RelayConnection {
    pub conn_id: u64,
    write: Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>,
    read_task: Option<JoinHandle<()>>,
}

impl RelayConnection {
    /// Wrap a WebSocket stream and spawn its read task.
    pub fn new(
        conn_id: u64,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let read_task = tokio::spawn(Self::read_loop(conn_id, read, event_tx));

        Self {
            conn_id,
            write: Arc::new(Mutex::new(write)),
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: u64,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from conn-{}", conn_id);
                            break;
                        }
                    };

                    if data.len() > MAX_FRAME_SIZE {
                        warn!(
                            "Frame from conn-{} exceeds max size ({} > {}), dropping",
                            conn_id,
                            data.len(),
                            MAX_FRAME_SIZE
                        );
                        continue;
                    }

                    match RelayFrame::from_binary(&data) {
                        Some(frame) => {
                            if event_tx.send(ConnectionEvent::Frame { conn_id, frame }).is_err() {
                                break;
                            }
                        }
                        None => warn!("Malformed frame from conn-{} ({} bytes)", conn_id, data.len()),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection conn-{} closed", conn_id);
                        }
                        _ => error!("WebSocket error on conn-{}: {}", conn_id, e),
                    }
                    break;
                }
                None => {
                    debug!("Connection conn-{} stream ended", conn_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Send a frame as a binary WebSocket message.
    pub async fn send(&self, frame: &RelayFrame) -> Result<()> {
        let data = frame.to_binary()?;
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(data.into()))
            .await
            .map_err(|e| anyhow!("Failed to send frame: {}", e))
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
