//! WebSocket server channel.
//!
//! Listens on `host:port/path`; each connection gets a chat id from the
//! `chatId`/`clientId` query string (or a random hex id), receives a `hello`
//! frame, and exchanges `{type:"message"}` JSON frames. The origin
//! allow-list is enforced at the upgrade handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nanobot_config::WebSocketConfig;
use nanobot_core::bus::InboundMessage;

use crate::base::{Channel, HandlerSlot, InboundHandler};

type ClientSender = mpsc::UnboundedSender<WsMessage>;

pub struct WebSocketChannel {
    config: WebSocketConfig,
    enabled: bool,
    handler: Arc<HandlerSlot>,
    clients: Arc<DashMap<String, ClientSender>>,
    cancel: CancellationToken,
    bound_addr: Mutex<Option<SocketAddr>>,
}

#[derive(Clone)]
struct WsState {
    allow_origins: Arc<Vec<String>>,
    clients: Arc<DashMap<String, ClientSender>>,
    handler: Arc<HandlerSlot>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsParams {
    chat_id: Option<String>,
    client_id: Option<String>,
}

#[derive(Serialize)]
struct WsOutFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(rename = "chatId")]
    chat_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
}

#[derive(Deserialize)]
struct WsInFrame {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(rename = "chatId", default)]
    chat_id: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    content: String,
}

impl WebSocketChannel {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            enabled: config.enabled,
            handler: Arc::new(HandlerSlot::new()),
            clients: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            bound_addr: Mutex::new(None),
            config,
        }
    }

    /// Address actually bound, for tests and logs.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().await
    }
}

#[async_trait]
impl Channel for WebSocketChannel {
    fn name(&self) -> &str {
        "websocket"
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

        let state = WsState {
            allow_origins: Arc::new(self.config.allow_origins.clone()),
            clients: self.clients.clone(),
            handler: self.handler.clone(),
        };

        let path = if self.config.path.is_empty() {
            "/ws".to_string()
        } else {
            self.config.path.clone()
        };
        let router = Router::new().route(&path, get(ws_upgrade)).with_state(state);

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        *self.bound_addr.lock().await = Some(listener.local_addr()?);
        info!("WebSocket channel listening on {addr}{path}");

        let cancel = self.cancel.clone();
        let clients = self.clients.clone();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            cancel.cancelled().await;
        });
        let result = server.await;
        clients.clear();
        result.map_err(Into::into)
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.clients.clear();
        Ok(())
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        if !self.enabled {
            anyhow::bail!("websocket channel not enabled");
        }
        if chat_id.is_empty() {
            anyhow::bail!("chat_id is required");
        }

        let sender = self
            .clients
            .get(chat_id)
            .ok_or_else(|| anyhow::anyhow!("client not connected: {chat_id}"))?;

        let frame = serde_json::to_string(&WsOutFrame {
            kind: "message",
            chat_id,
            sender: Some("assistant"),
            content: Some(text),
        })?;
        sender
            .send(WsMessage::Text(frame.into()))
            .map_err(|_| anyhow::anyhow!("client disconnected: {chat_id}"))?;

        info!("websocket send chat={chat_id} len={}", text.len());
        Ok(())
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<WsState>,
) -> Response {
    if !state.allow_origins.is_empty() {
        let origin = headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !state.allow_origins.iter().any(|a| a == origin) {
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let chat_id = params
        .chat_id
        .or(params.client_id)
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| format!("ws-{}", random_hex(8)));

    ws.on_upgrade(move |socket| handle_socket(socket, chat_id, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, chat_id: String, state: WsState) {
    info!("WebSocket connected: chat_id={chat_id}");
    let (ws_write, mut ws_read) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();

    // A reconnect under the same chat id replaces the old client.
    state.clients.insert(chat_id.clone(), tx.clone());
    let write_handle = tokio::spawn(write_loop(ws_write, rx, chat_id.clone()));

    let hello = serde_json::to_string(&WsOutFrame {
        kind: "hello",
        chat_id: &chat_id,
        sender: None,
        content: None,
    })
    .expect("hello frame serializes");
    let _ = tx.send(WsMessage::Text(hello.into()));

    while let Some(frame) = ws_read.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                warn!("WebSocket read error for {chat_id}: {e}");
                break;
            }
        };

        match frame {
            WsMessage::Text(text) => {
                let raw: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let parsed: WsInFrame = match serde_json::from_value(raw.clone()) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if !parsed.kind.is_empty() && parsed.kind != "message" {
                    continue;
                }
                let content = parsed.content.trim();
                if content.is_empty() {
                    continue;
                }

                let target_chat = if parsed.chat_id.is_empty() {
                    chat_id.clone()
                } else {
                    parsed.chat_id
                };
                let sender = if parsed.sender.is_empty() {
                    target_chat.clone()
                } else {
                    parsed.sender
                };

                info!("websocket inbound chat={target_chat} sender={sender}");
                state.handler.dispatch(
                    InboundMessage::new("websocket", &sender, &target_chat, content)
                        .with_id(&parsed.id)
                        .with_raw(raw),
                );
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.clients.remove(&chat_id);
    write_handle.abort();
    info!("WebSocket disconnected: chat_id={chat_id}");
}

async fn write_loop(
    mut ws_write: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<WsMessage>,
    chat_id: String,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = ws_write.send(frame).await {
            warn!("WebSocket write error for {chat_id}: {e}");
            break;
        }
    }
}

fn random_hex(bytes: usize) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    // Derived from the clock plus a counter; collision risk is acceptable
    // for ephemeral chat ids.
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let mut value = nanos ^ count.rotate_left(17) ^ (std::process::id() as u64).rotate_left(33);
    let mut out = String::with_capacity(bytes * 2);
    for _ in 0..bytes {
        value = value.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        out.push_str(&format!("{:02x}", (value >> 56) as u8));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_unique_hex() {
        let a = random_hex(8);
        let b = random_hex(8);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn in_frame_defaults() {
        let frame: WsInFrame = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert_eq!(frame.kind, "");
        assert_eq!(frame.id, "");
        assert_eq!(frame.content, "hi");

        let frame: WsInFrame =
            serde_json::from_str(r#"{"type":"message","id":"f1","chatId":"c1","content":"x"}"#)
                .unwrap();
        assert_eq!(frame.kind, "message");
        assert_eq!(frame.id, "f1");
        assert_eq!(frame.chat_id, "c1");
    }

    #[test]
    fn installed_handler_receives_dispatches() {
        let ch = WebSocketChannel::new(WebSocketConfig {
            enabled: true,
            ..Default::default()
        });
        let bus = Arc::new(nanobot_core::bus::MessageBus::new(4));
        ch.set_inbound_handler(crate::base::bus_inbound_handler(bus.clone()));

        ch.handler.dispatch(
            InboundMessage::new("websocket", "u", "c1", "hi")
                .with_id("f1")
                .with_raw(serde_json::json!({"type": "message"})),
        );

        let msg = bus.try_consume_inbound().unwrap();
        assert_eq!(msg.id, "f1");
        assert_eq!(msg.raw["type"], "message");
    }

    #[test]
    fn out_frame_shapes() {
        let hello = serde_json::to_value(WsOutFrame {
            kind: "hello",
            chat_id: "c1",
            sender: None,
            content: None,
        })
        .unwrap();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["chatId"], "c1");
        assert!(hello.get("content").is_none());

        let msg = serde_json::to_value(WsOutFrame {
            kind: "message",
            chat_id: "c1",
            sender: Some("assistant"),
            content: Some("hi"),
        })
        .unwrap();
        assert_eq!(msg["sender"], "assistant");
        assert_eq!(msg["content"], "hi");
    }

    #[tokio::test]
    async fn send_without_client_fails() {
        let ch = WebSocketChannel::new(WebSocketConfig {
            enabled: true,
            ..Default::default()
        });
        assert!(ch.send("nobody", "hi").await.is_err());
        assert!(ch.send("", "hi").await.is_err());
    }

    #[tokio::test]
    async fn disabled_channel_rejects_send() {
        let ch = WebSocketChannel::new(WebSocketConfig::default());
        assert!(!ch.enabled());
        assert!(ch.send("c", "hi").await.is_err());
    }
}
