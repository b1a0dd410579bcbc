//! Telegram channel over the raw Bot API.
//!
//! Long-polls `getUpdates` once per second with a running offset; outbound
//! uses `sendMessage` with HTML parse mode. An initial `getMe` call fills an
//! observable status snapshot for the Web UI.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nanobot_config::TelegramConfig;
use nanobot_core::bus::InboundMessage;

use crate::base::{is_sender_allowed, Channel, HandlerSlot, InboundHandler};

/// Status snapshot exposed through `/api/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelegramStatus {
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub link: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

pub struct TelegramChannel {
    config: TelegramConfig,
    client: reqwest::Client,
    handler: HandlerSlot,
    offset: AtomicI64,
    cancel: CancellationToken,
    status: Arc<RwLock<TelegramStatus>>,
    enabled: bool,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(30));
        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        let enabled = config.enabled && !config.token.is_empty();
        Ok(Self {
            client: builder.build()?,
            handler: HandlerSlot::new(),
            offset: AtomicI64::new(0),
            cancel: CancellationToken::new(),
            status: Arc::new(RwLock::new(TelegramStatus {
                enabled,
                ..Default::default()
            })),
            enabled,
            config,
        })
    }

    pub async fn status(&self) -> TelegramStatus {
        self.status.read().await.clone()
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.config.token)
    }

    async fn refresh_bot_info(&self) {
        let result: Result<serde_json::Value> = async {
            let resp = self.client.get(self.api_url("getMe")).send().await?;
            Ok(resp.json().await?)
        }
        .await;

        let mut status = self.status.write().await;
        match result {
            Ok(body) if body.get("ok").and_then(|v| v.as_bool()) == Some(true) => {
                let me = &body["result"];
                status.status = "ready".into();
                status.username = me
                    .get("username")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                status.name = me
                    .get("first_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                status.link = if status.username.is_empty() {
                    String::new()
                } else {
                    format!("https://t.me/{}", status.username)
                };
                status.error = String::new();
            }
            Ok(body) => {
                status.status = "error".into();
                status.error = body
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("invalid token")
                    .to_string();
            }
            Err(e) => {
                status.status = "error".into();
                status.error = e.to_string();
            }
        }
    }

    async fn fetch_updates(&self) {
        let offset = self.offset.load(Ordering::SeqCst);
        let resp = self
            .client
            .get(self.api_url("getUpdates"))
            .query(&[
                ("offset", (offset + 1).to_string()),
                ("limit", "100".to_string()),
            ])
            .send()
            .await;

        let body: serde_json::Value = match resp {
            Ok(r) => match r.json().await {
                Ok(b) => b,
                Err(e) => {
                    debug!("Telegram parse error: {e}");
                    return;
                }
            },
            Err(e) => {
                debug!("Telegram poll error: {e}");
                return;
            }
        };

        if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            return;
        }
        let Some(updates) = body.get("result").and_then(|v| v.as_array()) else {
            return;
        };

        for update in updates {
            self.handle_update(update);
        }
    }

    /// Advance the offset past one update and forward its message, if any.
    fn handle_update(&self, update: &serde_json::Value) {
        if let Some(update_id) = update.get("update_id").and_then(|v| v.as_i64()) {
            if update_id > self.offset.load(Ordering::SeqCst) {
                self.offset.store(update_id, Ordering::SeqCst);
            }
        }

        let Some(message) = update.get("message") else {
            return;
        };
        let text = message.get("text").and_then(|v| v.as_str()).unwrap_or("");
        if text.is_empty() {
            return;
        }

        let from = message.get("from");
        let user_id = from
            .and_then(|f| f.get("id"))
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string())
            .unwrap_or_default();
        let username = from
            .and_then(|f| f.get("username"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if !is_sender_allowed(&[user_id.as_str(), username.as_str()], &self.config.allow_from) {
            warn!("Telegram: ignoring message from unauthorized sender {user_id}/{username}");
            return;
        }

        let sender = if username.is_empty() { user_id } else { username };
        let chat_id = message
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string())
            .unwrap_or_default();
        let message_id = message
            .get("message_id")
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string())
            .unwrap_or_default();

        info!("telegram inbound chat={chat_id} sender={sender}");
        self.handler.dispatch(
            InboundMessage::new("telegram", &sender, &chat_id, text)
                .with_id(&message_id)
                .with_raw(update.clone()),
        );
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
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

        self.refresh_bot_info().await;
        {
            let status = self.status.read().await;
            match status.status.as_str() {
                "ready" => info!("Telegram bot @{} connected", status.username),
                _ => error!("Telegram getMe failed: {}", status.error),
            }
        }

        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.fetch_updates().await,
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        if !self.enabled {
            anyhow::bail!("telegram channel not enabled");
        }

        let params = [
            ("chat_id", chat_id),
            ("text", text),
            ("parse_mode", "HTML"),
        ];
        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .form(&params)
            .send()
            .await?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("telegram API error: {body}");
        }

        info!("telegram send chat={chat_id} len={}", text.len());
        Ok(())
    }
}
