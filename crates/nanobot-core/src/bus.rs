use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_BUFFER: usize = 100;

/// Media attached to an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    /// image, audio, video or document
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub mime: String,
}

/// Message received from a chat channel. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport-assigned message id; empty for synthesized records.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub id: String,
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub media: Option<MediaAttachment>,
    /// Original platform payload, for consumers that need transport detail.
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub raw: serde_json::Value,
    pub session_key: String,
}

impl InboundMessage {
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            id: String::new(),
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media: None,
            raw: serde_json::Value::Null,
            session_key: format!("{channel}:{chat_id}"),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }
}

/// Message to send to a chat channel. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

impl OutboundMessage {
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("message bus is closed")]
    Closed,
    #[error("message buffer is full")]
    Full,
    #[error("consume cancelled")]
    Cancelled,
}

/// Bounded in-memory queues connecting channels, agent and outbound pump.
///
/// Publishing never blocks: a full queue drops with `BusError::Full` so a
/// slow consumer cannot stall a chat transport.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<OutboundMessage>>,
    closed: std::sync::atomic::AtomicBool,
}

impl MessageBus {
    pub fn new(buffer: usize) -> Self {
        let buffer = if buffer == 0 { DEFAULT_BUFFER } else { buffer };
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        Self {
            inbound_tx,
            outbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn publish_inbound(&self, msg: InboundMessage) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.inbound_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BusError::Full,
            mpsc::error::TrySendError::Closed(_) => BusError::Closed,
        })
    }

    pub fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.outbound_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BusError::Full,
            mpsc::error::TrySendError::Closed(_) => BusError::Closed,
        })
    }

    /// Block until an inbound message arrives or the token fires.
    pub async fn consume_inbound(
        &self,
        cancel: &CancellationToken,
    ) -> Result<InboundMessage, BusError> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(BusError::Cancelled),
            msg = rx.recv() => msg.ok_or(BusError::Closed),
        }
    }

    /// Block until an outbound message arrives or the token fires.
    pub async fn consume_outbound(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OutboundMessage, BusError> {
        let mut rx = self.outbound_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(BusError::Cancelled),
            msg = rx.recv() => msg.ok_or(BusError::Closed),
        }
    }

    pub fn try_consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn try_consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Close the bus. Idempotent; later publishes fail with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_is_channel_and_chat() {
        let msg = InboundMessage::new("telegram", "u1", "42", "hi");
        assert_eq!(msg.session_key, "telegram:42");
    }

    #[test]
    fn synthesized_messages_have_empty_id_and_null_raw() {
        let msg = InboundMessage::new("cli", "user", "direct", "hi");
        assert!(msg.id.is_empty());
        assert!(msg.raw.is_null());
    }

    #[test]
    fn id_and_raw_carried_through() {
        let raw = serde_json::json!({"update_id": 7, "text": "hi"});
        let msg = InboundMessage::new("telegram", "u1", "42", "hi")
            .with_id("msg-7")
            .with_raw(raw.clone());
        assert_eq!(msg.id, "msg-7");
        assert_eq!(msg.raw, raw);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["id"], "msg-7");
        assert_eq!(json["raw"]["update_id"], 7);
    }

    #[tokio::test]
    async fn publish_then_consume() {
        let bus = MessageBus::new(4);
        bus.publish_inbound(InboundMessage::new("cli", "user", "1", "hello"))
            .unwrap();

        let cancel = CancellationToken::new();
        let msg = bus.consume_inbound(&cancel).await.unwrap();
        assert_eq!(msg.content, "hello");
    }

    #[tokio::test]
    async fn publish_fails_when_full() {
        let bus = MessageBus::new(2);
        bus.publish_outbound(OutboundMessage::new("cli", "1", "a"))
            .unwrap();
        bus.publish_outbound(OutboundMessage::new("cli", "1", "b"))
            .unwrap();

        let err = bus
            .publish_outbound(OutboundMessage::new("cli", "1", "c"))
            .unwrap_err();
        assert_eq!(err, BusError::Full);
    }

    #[tokio::test]
    async fn publish_fails_after_close() {
        let bus = MessageBus::new(2);
        bus.close();
        let err = bus
            .publish_inbound(InboundMessage::new("cli", "u", "1", "x"))
            .unwrap_err();
        assert_eq!(err, BusError::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let bus = MessageBus::new(2);
        bus.close();
        bus.close();
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn consume_respects_cancellation() {
        let bus = MessageBus::new(2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bus.consume_inbound(&cancel).await.unwrap_err();
        assert_eq!(err, BusError::Cancelled);
    }

    #[tokio::test]
    async fn try_consume_is_non_blocking() {
        let bus = MessageBus::new(2);
        assert!(bus.try_consume_inbound().is_none());

        bus.publish_inbound(InboundMessage::new("cli", "u", "1", "x"))
            .unwrap();
        assert!(bus.try_consume_inbound().is_some());
        assert!(bus.try_consume_inbound().is_none());
    }

    #[tokio::test]
    async fn zero_buffer_falls_back_to_default() {
        let bus = MessageBus::new(0);
        for i in 0..100 {
            bus.publish_inbound(InboundMessage::new("cli", "u", "1", &i.to_string()))
                .unwrap();
        }
        assert_eq!(
            bus.publish_inbound(InboundMessage::new("cli", "u", "1", "overflow"))
                .unwrap_err(),
            BusError::Full
        );
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let bus = MessageBus::new(8);
        for i in 0..5 {
            bus.publish_inbound(InboundMessage::new("cli", "u", "1", &i.to_string()))
                .unwrap();
        }
        let cancel = CancellationToken::new();
        for i in 0..5 {
            let msg = bus.consume_inbound(&cancel).await.unwrap();
            assert_eq!(msg.content, i.to_string());
        }
    }
}
