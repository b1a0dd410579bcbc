use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::bus::{MessageBus, OutboundMessage};
use crate::tools::Tool;

/// Sends messages to chat channels through the bus. The agent loop updates
/// the default routing context before each message it processes.
pub struct MessageTool {
    bus: Arc<MessageBus>,
    default_channel: Arc<RwLock<String>>,
    default_chat_id: Arc<RwLock<String>>,
}

impl MessageTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            default_channel: Arc::new(RwLock::new(String::new())),
            default_chat_id: Arc::new(RwLock::new(String::new())),
        }
    }

    /// Update the default routing context for this tool.
    pub async fn set_context(&self, channel: &str, chat_id: &str) {
        *self.default_channel.write().await = channel.to_string();
        *self.default_chat_id.write().await = chat_id.to_string();
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user through a chat channel. Use to communicate results, \
         ask questions, or split a long reply into several messages."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Message content to send",
                    "minLength": 1
                },
                "channel": {
                    "type": "string",
                    "description": "Channel to send to (optional, uses current if not specified)"
                },
                "chat_id": {
                    "type": "string",
                    "description": "Chat ID to send to (optional, uses current if not specified)"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;

        let channel = match params.get("channel").and_then(|v| v.as_str()) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => self.default_channel.read().await.clone(),
        };
        let chat_id = match params.get("chat_id").and_then(|v| v.as_str()) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => self.default_chat_id.read().await.clone(),
        };

        if channel.is_empty() || chat_id.is_empty() {
            return Ok("Error: no target channel/chat and no default context set".into());
        }

        match self
            .bus
            .publish_outbound(OutboundMessage::new(&channel, &chat_id, content))
        {
            Ok(()) => {
                info!("Message sent to {channel}:{chat_id}");
                Ok(format!("Message sent to {channel}:{chat_id}"))
            }
            Err(e) => Ok(format!("Error: failed to send message: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn sends_to_current_context() {
        let bus = Arc::new(MessageBus::new(4));
        let tool = MessageTool::new(bus.clone());
        tool.set_context("telegram", "42").await;

        let result = tool
            .execute(serde_json::json!({"content": "hi"}))
            .await
            .unwrap();
        assert!(result.contains("telegram:42"));

        let cancel = CancellationToken::new();
        let out = bus.consume_outbound(&cancel).await.unwrap();
        assert_eq!(out.channel, "telegram");
        assert_eq!(out.chat_id, "42");
        assert_eq!(out.content, "hi");
    }

    #[tokio::test]
    async fn explicit_target_overrides_context() {
        let bus = Arc::new(MessageBus::new(4));
        let tool = MessageTool::new(bus.clone());
        tool.set_context("telegram", "42").await;

        tool.execute(serde_json::json!({
            "content": "hi",
            "channel": "discord",
            "chat_id": "99"
        }))
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let out = bus.consume_outbound(&cancel).await.unwrap();
        assert_eq!(out.channel, "discord");
        assert_eq!(out.chat_id, "99");
    }

    #[tokio::test]
    async fn missing_context_is_tool_error_text() {
        let bus = Arc::new(MessageBus::new(4));
        let tool = MessageTool::new(bus);
        let result = tool
            .execute(serde_json::json!({"content": "hi"}))
            .await
            .unwrap();
        assert!(result.contains("no default context"));
    }
}
