mod openai;

pub use openai::OpenAiProvider;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A chat message on the OpenAI-compatible wire.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }
}

/// A model-emitted request to execute a named capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON text; may be assembled incrementally during streaming.
    pub arguments: String,
}

/// Non-streaming completion result.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl Response {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Callbacks for a streaming completion.
///
/// `on_tool_call_start` fires once per call when both id and name are
/// known; argument fragments follow as `on_tool_call_delta`; `on_tool_call_end`
/// fires at stream end for every call with non-empty arguments.
pub trait StreamHandler: Send {
    fn on_content(&mut self, token: &str);
    fn on_tool_call_start(&mut self, id: &str, name: &str);
    fn on_tool_call_delta(&mut self, id: &str, fragment: &str);
    fn on_tool_call_end(&mut self, id: &str);
    fn on_complete(&mut self) {}
    fn on_error(&mut self, _err: &anyhow::Error) {}
}

/// An OpenAI-compatible chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
        model: &str,
    ) -> Result<Response>;

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
        model: &str,
        handler: &mut dyn StreamHandler,
    ) -> Result<()>;

    fn default_model(&self) -> &str;
}
