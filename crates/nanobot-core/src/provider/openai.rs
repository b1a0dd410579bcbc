use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::{LlmProvider, Message, Response, StreamHandler, ToolCall};

/// OpenAI-compatible chat-completion client (string content form, so
/// DeepSeek, Moonshot, vLLM and friends all speak it).
pub struct OpenAiProvider {
    api_key: String,
    api_base: String,
    default_model: String,
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, api_base: &str, default_model: &str) -> Result<Self> {
        if api_key.is_empty() {
            return Err(anyhow!("API key is required"));
        }

        let api_base = if api_base.is_empty() {
            "https://api.openai.com/v1".to_string()
        } else {
            api_base.trim_end_matches('/').to_string()
        };

        let default_model = if default_model.is_empty() {
            "gpt-4".to_string()
        } else {
            default_model.to_string()
        };

        Ok(Self {
            api_key: api_key.to_string(),
            api_base,
            default_model,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            // No overall timeout on the stream client: a long completion
            // keeps the socket open well past 60s.
            stream_client: reqwest::Client::new(),
        })
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
        model: &str,
        stream: bool,
    ) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: messages.iter().map(wire_message).collect(),
            tools: tools.to_vec(),
            tool_choice: if tools.is_empty() {
                None
            } else {
                Some("auto".into())
            },
            stream,
        }
    }

    fn resolve_model<'a>(&'a self, model: &'a str) -> &'a str {
        if model.is_empty() {
            &self.default_model
        } else {
            model
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
        model: &str,
    ) -> Result<Response> {
        let model = self.resolve_model(model);
        let request = self.build_request(messages, tools, model, false);

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("chat completion failed: {e}"))?;

        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "chat completion failed: {}",
                format_api_error(&body, status.as_u16())
            ));
        }

        let parsed: ChatResponse = serde_json::from_slice(&body)
            .map_err(|e| anyhow!("failed to parse response: {e}"))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no response from model"))?;

        Ok(Response {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice.message.tool_calls,
        })
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
        model: &str,
        handler: &mut dyn StreamHandler,
    ) -> Result<()> {
        let model = self.resolve_model(model);
        let request = self.build_request(messages, tools, model, true);

        let resp = self
            .stream_client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let err = anyhow!("stream request failed: {e}");
                handler.on_error(&err);
                err
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.bytes().await.unwrap_or_default();
            let err = anyhow!(
                "stream request failed: {}",
                format_api_error(&body, status.as_u16())
            );
            handler.on_error(&err);
            return Err(err);
        }

        let mut assembler = ToolCallAssembler::new();
        let mut lines = LineBuffer::new();
        let mut byte_stream = resp.bytes_stream();
        let mut done = false;

        'stream: while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let err = anyhow!("stream error: {e}");
                    handler.on_error(&err);
                    return Err(err);
                }
            };
            lines.push(&chunk);

            while let Some(line) = lines.next_line() {
                match process_sse_line(&line, &mut assembler, handler) {
                    Ok(SseLine::Done) => {
                        done = true;
                        break 'stream;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        handler.on_error(&e);
                        return Err(e);
                    }
                }
            }
        }

        // Flush a trailing line when the stream closed without [DONE].
        if !done {
            if let Some(line) = lines.take_remainder() {
                if let Err(e) = process_sse_line(&line, &mut assembler, handler) {
                    handler.on_error(&e);
                    return Err(e);
                }
            }
        }

        assembler.finish(handler);
        handler.on_complete();
        Ok(())
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[derive(Debug)]
enum SseLine {
    Handled,
    Done,
}

fn process_sse_line(
    line: &str,
    assembler: &mut ToolCallAssembler,
    handler: &mut dyn StreamHandler,
) -> Result<SseLine> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Handled);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Handled);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk: ChatStreamChunk =
        serde_json::from_str(data).map_err(|e| anyhow!("stream decode error: {e}"))?;

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(SseLine::Handled);
    };

    if !choice.delta.content.is_empty() {
        handler.on_content(&choice.delta.content);
    }
    assembler.apply(&choice.delta.tool_calls, handler);

    Ok(SseLine::Handled)
}

/// Accumulates raw network chunks and yields complete lines.
///
/// Buffering happens at the byte level: a multi-byte character split across
/// two chunks must not be decoded until its line is complete.
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let rest = self.buf.split_off(pos + 1);
        let mut line = std::mem::replace(&mut self.buf, rest);
        line.truncate(pos);
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&std::mem::take(&mut self.buf)).into_owned();
        if line.trim().is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

#[derive(Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

/// Reconstructs tool calls from stream deltas.
///
/// Builders are keyed by the stream-local integer index: id and name may
/// arrive in different chunks than the argument fragments.
pub(crate) struct ToolCallAssembler {
    builders: BTreeMap<u32, ToolCallBuilder>,
}

impl ToolCallAssembler {
    pub(crate) fn new() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    pub(crate) fn apply(&mut self, deltas: &[ToolCallDelta], handler: &mut dyn StreamHandler) {
        for delta in deltas {
            let builder = self.builders.entry(delta.index).or_default();

            if let Some(id) = &delta.id {
                if !id.is_empty() {
                    builder.id = id.clone();
                }
            }
            if let Some(function) = &delta.function {
                if let Some(name) = &function.name {
                    if !name.is_empty() {
                        builder.name = name.clone();
                    }
                }
            }

            if !builder.started && !builder.id.is_empty() && !builder.name.is_empty() {
                builder.started = true;
                handler.on_tool_call_start(&builder.id, &builder.name);
            }

            if let Some(function) = &delta.function {
                if let Some(arguments) = &function.arguments {
                    if !arguments.is_empty() {
                        builder.arguments.push_str(arguments);
                        if !builder.id.is_empty() {
                            handler.on_tool_call_delta(&builder.id, arguments);
                        }
                    }
                }
            }
        }
    }

    /// Emit `on_tool_call_end` for every builder with non-empty arguments.
    pub(crate) fn finish(&mut self, handler: &mut dyn StreamHandler) {
        for builder in self.builders.values() {
            if !builder.arguments.is_empty() && !builder.id.is_empty() {
                handler.on_tool_call_end(&builder.id);
            }
        }
        self.builders.clear();
    }
}

fn wire_message(msg: &Message) -> ChatMessage {
    ChatMessage {
        role: msg.role.clone(),
        // The wire requires an assistant turn that carries tool calls to
        // omit its content when empty.
        content: if msg.content.is_empty() {
            None
        } else {
            Some(msg.content.clone())
        },
        tool_call_id: msg.tool_call_id.clone(),
        tool_calls: msg.tool_calls.clone(),
    }
}

fn format_api_error(body: &[u8], status: u16) -> String {
    if let Ok(parsed) = serde_json::from_slice::<ChatErrorResponse>(body) {
        if !parsed.error.message.is_empty() {
            return format!("status {status}: {}", parsed.error.message);
        }
    }
    format!("status {status}: {}", String::from_utf8_lossy(body).trim())
}

// ---- wire structs ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Deserialize)]
pub(crate) struct ToolCallDelta {
    pub(crate) index: u32,
    #[serde(default)]
    pub(crate) id: Option<String>,
    #[serde(default)]
    pub(crate) function: Option<ToolCallFunctionDelta>,
}

#[derive(Deserialize)]
pub(crate) struct ToolCallFunctionDelta {
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) arguments: Option<String>,
}

#[derive(Deserialize)]
struct ChatErrorResponse {
    #[serde(default)]
    error: ApiError,
}

#[derive(Deserialize, Default)]
struct ApiError {
    #[serde(default)]
    message: String,
}
