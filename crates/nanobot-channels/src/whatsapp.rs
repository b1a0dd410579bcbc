//! WhatsApp channel via an external bridge process.
//!
//! Maintains a reconnecting WebSocket to the bridge, which speaks a small
//! typed frame protocol: {message, status, qr, error} inbound and
//! {type:"send", to, text} outbound. QR strings and connection status are
//! kept for UI consumption.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nanobot_config::WhatsAppConfig;
use nanobot_core::bus::InboundMessage;

use crate::base::{is_sender_allowed, Channel, HandlerSlot, InboundHandler};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const ECHO_WINDOW: Duration = Duration::from_secs(45);

type BridgeSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Status snapshot exposed through `/api/status`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppStatus {
    pub enabled: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub qr: String,
}

#[derive(Debug, Deserialize)]
struct BridgeFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    content: String,
    #[serde(default, rename = "fromMe")]
    from_me: bool,
    #[serde(default)]
    status: String,
    #[serde(default)]
    qr: String,
}

struct OutboundRecord {
    chat_id: String,
    text: String,
    at: Instant,
}

pub struct WhatsAppChannel {
    config: WhatsAppConfig,
    enabled: bool,
    handler: HandlerSlot,
    cancel: CancellationToken,
    sink: Mutex<Option<BridgeSink>>,
    status: Arc<RwLock<WhatsAppStatus>>,
    recent_outbound: Mutex<Vec<OutboundRecord>>,
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppConfig) -> Self {
        let enabled = config.enabled && !config.bridge_url.trim().is_empty();
        Self {
            enabled,
            handler: HandlerSlot::new(),
            cancel: CancellationToken::new(),
            sink: Mutex::new(None),
            status: Arc::new(RwLock::new(WhatsAppStatus {
                enabled,
                ..Default::default()
            })),
            recent_outbound: Mutex::new(Vec::new()),
            config,
        }
    }

    pub async fn status(&self) -> WhatsAppStatus {
        self.status.read().await.clone()
    }

    async fn set_connected(&self, connected: bool) {
        let mut status = self.status.write().await;
        status.connected = connected;
        if !connected {
            status.status = "disconnected".into();
        }
    }

    async fn remember_outbound(&self, chat_id: &str, text: &str) {
        let mut recent = self.recent_outbound.lock().await;
        let now = Instant::now();
        recent.retain(|r| now.duration_since(r.at) <= ECHO_WINDOW);
        recent.push(OutboundRecord {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            at: now,
        });
    }

    async fn is_outbound_echo(&self, chat_id: &str, text: &str) -> bool {
        let mut recent = self.recent_outbound.lock().await;
        let now = Instant::now();
        recent.retain(|r| now.duration_since(r.at) <= ECHO_WINDOW);
        recent.iter().any(|r| r.chat_id == chat_id && r.text == text)
    }

    async fn handle_frame(&self, data: &str) {
        let raw: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return,
        };
        let frame: BridgeFrame = match serde_json::from_value(raw.clone()) {
            Ok(f) => f,
            Err(_) => return,
        };

        match frame.kind.as_str() {
            "message" => {
                if frame.content.is_empty() || frame.sender.is_empty() {
                    return;
                }
                if frame.from_me && !self.config.allow_self {
                    return;
                }
                if frame.from_me
                    && self.config.allow_self
                    && self.is_outbound_echo(&frame.sender, &frame.content).await
                {
                    return;
                }

                let normalized = normalize_sender(&frame.sender);
                if !is_sender_allowed(&[frame.sender.as_str(), normalized], &self.config.allow_from)
                {
                    return;
                }

                info!(
                    "whatsapp inbound chat={} sender={normalized} fromMe={}",
                    frame.sender, frame.from_me
                );
                self.handler.dispatch(
                    InboundMessage::new("whatsapp", normalized, &frame.sender, &frame.content)
                        .with_id(&frame.id)
                        .with_raw(raw),
                );
            }
            "status" => {
                let mut status = self.status.write().await;
                match frame.status.as_str() {
                    "connected" => {
                        status.connected = true;
                        status.status = "connected".into();
                    }
                    "disconnected" => {
                        status.connected = false;
                        status.status = "disconnected".into();
                    }
                    _ => {}
                }
            }
            "qr" => {
                if !frame.qr.is_empty() {
                    self.status.write().await.qr = frame.qr;
                }
            }
            _ => {}
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let (stream, _) = tokio_tungstenite::connect_async(&self.config.bridge_url).await?;
        let (sink, mut read) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.set_connected(true).await;
        info!("WhatsApp bridge connected: {}", self.config.bridge_url);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => self.handle_frame(&text).await,
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("WhatsApp bridge read error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        *self.sink.lock().await = None;
        self.set_connected(false).await;
        Ok(())
    }
}

fn normalize_sender(sender: &str) -> &str {
    sender.split('@').next().unwrap_or(sender)
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_inbound_handler(&self, handler: InboundHandler) {
        self.handler.set(handler);
    }

    async fn start(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if let Err(e) = self.connect_once().await {
                warn!("WhatsApp bridge connection failed: {e}");
                self.set_connected(false).await;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        Ok(())
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        if !self.enabled {
            anyhow::bail!("whatsapp channel not enabled");
        }

        let payload = serde_json::json!({
            "type": "send",
            "to": chat_id,
            "text": text,
        });

        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("whatsapp bridge not connected"))?;
        sink.send(WsMessage::Text(payload.to_string().into()))
            .await?;
        drop(guard);

        self.remember_outbound(chat_id, text).await;
        info!("whatsapp send chat={chat_id} len={}", text.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::bus_inbound_handler;
    use nanobot_core::bus::MessageBus;

    fn channel(allow_self: bool, allow_from: Vec<String>) -> (WhatsAppChannel, Arc<MessageBus>) {
        let ch = WhatsAppChannel::new(WhatsAppConfig {
            enabled: true,
            bridge_url: "ws://localhost:3001".into(),
            allow_from,
            allow_self,
        });
        let bus = Arc::new(MessageBus::new(4));
        ch.set_inbound_handler(bus_inbound_handler(bus.clone()));
        (ch, bus)
    }

    fn message_frame(sender: &str, content: &str, from_me: bool) -> String {
        serde_json::json!({
            "type": "message",
            "id": "wamid.1",
            "sender": sender,
            "content": content,
            "fromMe": from_me
        })
        .to_string()
    }

    #[tokio::test]
    async fn inbound_message_forwarded_with_id_and_raw() {
        let (ch, bus) = channel(false, vec![]);
        let frame = message_frame("12345@s.whatsapp.net", "hello", false);
        ch.handle_frame(&frame).await;

        let msg = bus.try_consume_inbound().unwrap();
        assert_eq!(msg.channel, "whatsapp");
        assert_eq!(msg.sender_id, "12345");
        assert_eq!(msg.chat_id, "12345@s.whatsapp.net");
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.id, "wamid.1");
        assert_eq!(msg.raw, serde_json::from_str::<serde_json::Value>(&frame).unwrap());
    }

    #[tokio::test]
    async fn from_me_dropped_without_allow_self() {
        let (ch, bus) = channel(false, vec![]);
        ch.handle_frame(&message_frame("u@s", "hi", true)).await;
        assert!(bus.try_consume_inbound().is_none());
    }

    #[tokio::test]
    async fn allow_self_suppresses_recent_echo() {
        let (ch, bus) = channel(true, vec![]);

        // Simulate sending "hi" to u@s, then the bridge echoing it back.
        ch.remember_outbound("u@s", "hi").await;
        ch.handle_frame(&message_frame("u@s", "hi", true)).await;
        assert!(bus.try_consume_inbound().is_none());

        // A different text from ourselves is not an echo.
        ch.handle_frame(&message_frame("u@s", "something else", true))
            .await;
        assert!(bus.try_consume_inbound().is_some());
    }

    #[tokio::test]
    async fn allow_list_checks_normalized_sender() {
        let (ch, bus) = channel(false, vec!["12345".into()]);

        ch.handle_frame(&message_frame("12345@s.whatsapp.net", "ok", false))
            .await;
        assert!(bus.try_consume_inbound().is_some());

        ch.handle_frame(&message_frame("99999@s.whatsapp.net", "no", false))
            .await;
        assert!(bus.try_consume_inbound().is_none());
    }

    #[tokio::test]
    async fn status_and_qr_frames_update_snapshot() {
        let (ch, _bus) = channel(false, vec![]);

        ch.handle_frame(r#"{"type":"status","status":"connected"}"#)
            .await;
        let status = ch.status().await;
        assert_eq!(status.status, "connected");

        ch.handle_frame(r#"{"type":"qr","qr":"QRDATA"}"#).await;
        assert_eq!(ch.status().await.qr, "QRDATA");
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let (ch, _bus) = channel(false, vec![]);
        assert!(ch.send("u@s", "hi").await.is_err());
    }

    #[test]
    fn disabled_without_bridge_url() {
        let ch = WhatsAppChannel::new(WhatsAppConfig {
            enabled: true,
            bridge_url: "  ".into(),
            allow_from: vec![],
            allow_self: false,
        });
        assert!(!ch.enabled());
    }
}
