//! Discord channel over the raw gateway WebSocket.
//!
//! Opens an intent-scoped gateway session (Hello → Identify → heartbeat
//! loop), forwards non-bot MESSAGE_CREATE dispatches, and sends outbound
//! messages through the REST channel-send endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nanobot_config::DiscordConfig;
use nanobot_core::bus::InboundMessage;

use crate::base::{is_sender_allowed, Channel, HandlerSlot, InboundHandler};

// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = 37377;

pub struct DiscordChannel {
    config: DiscordConfig,
    client: reqwest::Client,
    handler: HandlerSlot,
    cancel: CancellationToken,
    enabled: bool,
}

impl DiscordChannel {
    pub fn new(config: DiscordConfig) -> Self {
        let enabled = config.enabled && !config.token.is_empty();
        Self {
            client: reqwest::Client::new(),
            handler: HandlerSlot::new(),
            cancel: CancellationToken::new(),
            enabled,
            config,
        }
    }

    async fn gateway_url(&self) -> Result<String> {
        let resp: serde_json::Value = self
            .client
            .get("https://discord.com/api/v10/gateway/bot")
            .header("Authorization", format!("Bot {}", self.config.token))
            .send()
            .await
            .context("fetch Discord gateway URL")?
            .json()
            .await
            .context("parse Discord gateway response")?;

        let url = resp
            .get("url")
            .and_then(|u| u.as_str())
            .unwrap_or("wss://gateway.discord.gg");
        Ok(format!("{url}/?v=10&encoding=json"))
    }

    /// One gateway session: identify, heartbeat, dispatch until the socket
    /// drops or the server asks for a reconnect.
    async fn run_session(&self) -> Result<()> {
        let ws_url = self.gateway_url().await?;
        info!("Discord: connecting to gateway...");

        let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .context("connect to Discord gateway WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        // Hello (op 10) carries the heartbeat interval.
        let hello = read
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("gateway closed before hello"))?
            .context("read Discord gateway hello")?;
        let hello: serde_json::Value =
            serde_json::from_str(hello.to_text().unwrap_or_default())
                .context("parse Discord gateway hello")?;
        let heartbeat_ms = hello
            .get("d")
            .and_then(|d| d.get("heartbeat_interval"))
            .and_then(|v| v.as_u64())
            .unwrap_or(41_250);

        let identify = json!({
            "op": 2,
            "d": {
                "token": self.config.token,
                "intents": GATEWAY_INTENTS,
                "properties": {"os": "linux", "browser": "nanobot", "device": "nanobot"}
            }
        });
        write
            .send(WsMessage::Text(identify.to_string().into()))
            .await
            .context("send Discord gateway identify")?;
        info!("Discord: connected and identified");

        let mut sequence: i64 = -1;
        let mut heartbeat =
            tokio::time::interval(std::time::Duration::from_millis(heartbeat_ms));
        heartbeat.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    let d = if sequence >= 0 { json!(sequence) } else { json!(null) };
                    let frame = json!({"op": 1, "d": d});
                    if write.send(WsMessage::Text(frame.to_string().into())).await.is_err() {
                        anyhow::bail!("heartbeat write failed");
                    }
                }
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(WsMessage::Text(t))) => t,
                        Some(Ok(WsMessage::Close(_))) | None => anyhow::bail!("gateway closed"),
                        Some(Err(e)) => anyhow::bail!("gateway read error: {e}"),
                        _ => continue,
                    };

                    let event: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(e) => e,
                        Err(_) => continue,
                    };

                    if let Some(s) = event.get("s").and_then(|v| v.as_i64()) {
                        sequence = s;
                    }

                    match event.get("op").and_then(|v| v.as_u64()).unwrap_or(0) {
                        1 => {
                            let d = if sequence >= 0 { json!(sequence) } else { json!(null) };
                            let frame = json!({"op": 1, "d": d});
                            if write.send(WsMessage::Text(frame.to_string().into())).await.is_err() {
                                anyhow::bail!("heartbeat write failed");
                            }
                            continue;
                        }
                        7 | 9 => anyhow::bail!("gateway requested reconnect"),
                        _ => {}
                    }

                    if event.get("t").and_then(|t| t.as_str()) != Some("MESSAGE_CREATE") {
                        continue;
                    }
                    let Some(d) = event.get("d") else { continue };
                    self.handle_message_create(d);
                }
            }
        }
    }

    fn handle_message_create(&self, d: &serde_json::Value) {
        let author = d.get("author");
        if author
            .and_then(|a| a.get("bot"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return;
        }

        let author_id = author
            .and_then(|a| a.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let username = author
            .and_then(|a| a.get("username"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let discriminator = author
            .and_then(|a| a.get("discriminator"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let label = if discriminator.is_empty() || discriminator == "0" {
            username.to_string()
        } else {
            format!("{username}#{discriminator}")
        };

        if !is_sender_allowed(&[author_id, username, &label], &self.config.allow_from) {
            warn!("Discord: ignoring message from unauthorized user {author_id}");
            return;
        }

        let content = d.get("content").and_then(|v| v.as_str()).unwrap_or("");
        if content.is_empty() {
            return;
        }
        let channel_id = d
            .get("channel_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let message_id = d.get("id").and_then(|v| v.as_str()).unwrap_or("");

        info!("discord inbound chat={channel_id} sender={label}");
        self.handler.dispatch(
            InboundMessage::new("discord", &label, &channel_id, content)
                .with_id(message_id)
                .with_raw(d.clone()),
        );
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
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
            if let Err(e) = self.run_session().await {
                warn!("Discord session ended: {e}");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        if !self.enabled {
            anyhow::bail!("discord channel not enabled");
        }

        let url = format!("https://discord.com/api/v10/channels/{chat_id}/messages");
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bot {}", self.config.token))
            .json(&json!({"content": text}))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("discord send failed ({status}): {body}");
        }

        info!("discord send chat={chat_id} len={}", text.len());
        Ok(())
    }
}
