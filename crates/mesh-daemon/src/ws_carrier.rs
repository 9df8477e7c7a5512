//! `Carrier` implementation over the WebSocket relay.
//!
//! The socket is split between two tasks. The writer drains an outbound
//! frame queue; the reader decodes deliveries into envelopes and queues them
//! as `CarrierEvent`s. `poll` empties that queue without blocking, so the
//! engine only ever sees inbound traffic from inside `update`.
//!
//! Receipt timestamps come from the carrier's clock and feed the engine's
//! liveness and clock-sync math, so give the carrier the same `Clock` as the
//! engine (`connect` uses `SystemClock`).

use crate::frame::{MAX_FRAME_SIZE, RelayFrame};
use futures::{SinkExt, StreamExt};
use mesh_core::carrier::Result;
use mesh_core::{
    Carrier, CarrierError, CarrierEvent, ChannelId, ChannelInfo, Clock, Envelope, MeshId, PeerId,
    SystemClock,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

pub struct WebSocketCarrier {
    url: String,
    outbound: Option<mpsc::UnboundedSender<RelayFrame>>,
    events_tx: mpsc::UnboundedSender<CarrierEvent>,
    events_rx: mpsc::UnboundedReceiver<CarrierEvent>,
    topics: BTreeSet<MeshId>,
    joined: bool,
    read_task: Option<JoinHandle<()>>,
}

impl WebSocketCarrier {
    /// Connect to a relay at `url` (`ws://` or `wss://`), stamping receipts
    /// with wall-clock time.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_clock(url, Arc::new(SystemClock)).await
    }

    /// Connect, stamping receipts with `clock`.
    pub async fn connect_with_clock(url: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(CarrierError::InvalidEndpoint(url.to_string()));
        }
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| CarrierError::ConnectionFailed(format!("{}: {}", url, e)))?;
        info!("Connected to relay {}", url);

        let (mut write, mut read) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Runs until the carrier drops its sender, then closes the socket
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let data = match frame.to_binary() {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Failed to encode frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Binary(data.into())).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_tx = events_tx.clone();
        let read_task = tokio::spawn(async move {
            let reason = loop {
                let data = match read.next().await {
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Close(_))) => break "relay closed the connection".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                };
                if let Some(envelope) = decode_delivery(&data, clock.as_ref()) {
                    if reader_tx.send(CarrierEvent::Message(envelope)).is_err() {
                        return;
                    }
                }
            };
            debug!("Relay connection lost: {}", reason);
            let _ = reader_tx.send(CarrierEvent::Disconnected { reason });
        });

        Ok(Self {
            url: url.to_string(),
            outbound: Some(outbound),
            events_tx,
            events_rx,
            topics: BTreeSet::new(),
            joined: false,
            read_task: Some(read_task),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    fn push(&self, frame: RelayFrame) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(CarrierError::Closed)?;
        outbound.send(frame).map_err(|_| CarrierError::Closed)
    }

    fn subscribe(&mut self, topic: MeshId) -> Result<()> {
        self.push(RelayFrame::Subscribe { topic })?;
        self.topics.insert(topic);
        Ok(())
    }
}

/// Turn a relay delivery into an envelope stamped with its receipt time.
fn decode_delivery(data: &[u8], clock: &dyn Clock) -> Option<Envelope> {
    if data.len() > MAX_FRAME_SIZE {
        warn!("Delivery exceeds max size ({} > {}), dropping", data.len(), MAX_FRAME_SIZE);
        return None;
    }
    let Some(RelayFrame::Deliver { topic, data }) = RelayFrame::from_binary(data) else {
        warn!("Unexpected frame from relay, dropping");
        return None;
    };
    match Envelope::from_json(data.as_bytes()) {
        Ok(mut envelope) => {
            envelope.receipt_timestamp = clock.now_ms();
            Some(envelope)
        }
        Err(e) => {
            warn!("Malformed envelope on {}: {}", topic, e);
            None
        }
    }
}

impl Carrier for WebSocketCarrier {
    fn join(&mut self, channel: &ChannelInfo, local_id: PeerId, _local_hello_data: &str) -> Result<()> {
        if self.joined {
            return Err(CarrierError::ConnectionFailed("already joined".to_string()));
        }
        self.subscribe(local_id)?;
        self.subscribe(channel.id)?;
        self.joined = true;
        // Subscriptions are ordered ahead of any publish on the same socket
        let _ = self.events_tx.send(CarrierEvent::Joined);
        Ok(())
    }

    fn listen(&mut self, channel: ChannelId) -> Result<()> {
        if !self.joined {
            return Err(CarrierError::Closed);
        }
        self.subscribe(channel)
    }

    fn stop_listening(&mut self, channel: ChannelId) {
        if !self.topics.remove(&channel) {
            return;
        }
        if let Err(e) = self.push(RelayFrame::Unsubscribe { topic: channel }) {
            debug!("Unsubscribe from {} not sent: {}", channel, e);
        }
    }

    fn send(&mut self, envelope: &Envelope) {
        let data = match envelope.to_json().map(String::from_utf8) {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                warn!("Envelope is not UTF-8: {}", e);
                return;
            }
            Err(e) => {
                warn!("Failed to encode envelope: {}", e);
                return;
            }
        };
        let frame = RelayFrame::Publish {
            topic: envelope.destination,
            data,
        };
        if let Err(e) = self.push(frame) {
            warn!("Dropped envelope to {}: {}", envelope.destination, e);
        }
    }

    /// Unsubscribe everything and close the socket once queued frames flush.
    fn leave(&mut self) {
        for topic in std::mem::take(&mut self.topics) {
            let _ = self.push(RelayFrame::Unsubscribe { topic });
        }
        self.outbound = None;
        self.joined = false;
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        info!("Left relay {}", self.url);
    }

    fn poll(&mut self) -> Vec<CarrierEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Drop for WebSocketCarrier {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{ManualClock, MessageKind};

    fn envelope() -> Envelope {
        Envelope {
            destination: MeshId::for_name("lobby"),
            sender_id: MeshId::from(0x42),
            sequence_number: 1,
            kind: MessageKind::Ping,
            sent_timestamp: 1_000,
            receipt_timestamp: 0,
            payload: String::new(),
        }
    }

    fn delivery(data: String) -> Vec<u8> {
        RelayFrame::Deliver {
            topic: MeshId::for_name("lobby"),
            data,
        }
        .to_binary()
        .unwrap()
    }

    #[test]
    fn test_decode_delivery_stamps_receipt() {
        let json = String::from_utf8(envelope().to_json().unwrap()).unwrap();
        let decoded = decode_delivery(&delivery(json), &SystemClock).unwrap();

        assert_eq!(decoded.sender_id, MeshId::from(0x42));
        assert!(decoded.receipt_timestamp > 0);
    }

    #[test]
    fn test_decode_delivery_uses_carrier_clock() {
        let clock = ManualClock::new(42_000);
        let json = String::from_utf8(envelope().to_json().unwrap()).unwrap();
        let decoded = decode_delivery(&delivery(json), &clock).unwrap();

        assert_eq!(decoded.receipt_timestamp, 42_000);
        assert_eq!(decoded.sent_timestamp, 1_000);
    }

    #[test]
    fn test_decode_delivery_drops_garbage() {
        assert!(decode_delivery(&delivery("not json".to_string()), &SystemClock).is_none());
        assert!(decode_delivery(b"\xff\xff", &SystemClock).is_none());
    }

    #[test]
    fn test_decode_delivery_ignores_other_frames() {
        let frame = RelayFrame::Subscribe {
            topic: MeshId::for_name("lobby"),
        };
        assert!(decode_delivery(&frame.to_binary().unwrap(), &SystemClock).is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_non_websocket_url() {
        let result = WebSocketCarrier::connect("http://127.0.0.1:9400").await;
        assert!(matches!(result, Err(CarrierError::InvalidEndpoint(_))));
    }
}
