use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::context::ContextBuilder;
use crate::bus::{BusError, InboundMessage, MessageBus, OutboundMessage};
use crate::cron::CronService;
use crate::provider::{LlmProvider, Message, StreamHandler, ToolCall, ToolCallFunction};
use crate::session::SessionManager;
use crate::tools::cron::CronTool;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::message::MessageTool;
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::web::{WebFetchOptions, WebFetchTool, WebSearchTool};
use crate::tools::{Tool, ToolRegistry};

/// Construction knobs for the agent loop, straight from config.
pub struct AgentConfig {
    pub workspace: PathBuf,
    pub model: String,
    pub max_iterations: usize,
    pub brave_api_key: String,
    pub web_fetch: WebFetchOptions,
    pub exec_timeout_secs: u64,
    pub restrict_to_workspace: bool,
}

/// Per-message reasoning loop: stream the model, execute tool calls, feed
/// results back, repeat until the model answers in plain text or the
/// iteration cap trips. One instance serves the whole process; messages are
/// handled strictly in FIFO order.
pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn LlmProvider>,
    model: String,
    max_iterations: usize,
    context: ContextBuilder,
    sessions: SessionManager,
    tools: ToolRegistry,
    message_tool: Arc<MessageTool>,
    cron_tool: Option<Arc<CronTool>>,
}

impl AgentLoop {
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        config: AgentConfig,
        cron_service: Option<Arc<CronService>>,
    ) -> Self {
        let max_iterations = if config.max_iterations == 0 {
            20
        } else {
            config.max_iterations
        };

        let allowed_dir = if config.restrict_to_workspace {
            Some(config.workspace.clone())
        } else {
            None
        };

        let mut tools = ToolRegistry::new();
        tools.register(Box::new(ReadFileTool::new(allowed_dir.clone())));
        tools.register(Box::new(WriteFileTool::new(allowed_dir.clone())));
        tools.register(Box::new(EditFileTool::new(allowed_dir.clone())));
        tools.register(Box::new(ListDirTool::new(allowed_dir)));
        tools.register(Box::new(ExecTool::new(
            config.workspace.clone(),
            config.exec_timeout_secs,
            config.restrict_to_workspace,
        )));
        tools.register(Box::new(WebSearchTool::new(config.brave_api_key.clone(), 5)));
        tools.register(Box::new(WebFetchTool::new(config.web_fetch.clone())));
        tools.register(Box::new(SpawnTool::new(Some(Arc::new(|update| {
            info!("{update}");
        })))));

        let message_tool = Arc::new(MessageTool::new(bus.clone()));
        tools.register(Box::new(SharedTool(message_tool.clone())));

        let cron_tool = cron_service.map(|service| {
            let tool = Arc::new(CronTool::new(service));
            tools.register(Box::new(SharedTool(tool.clone())));
            tool
        });

        Self {
            bus,
            provider,
            model: config.model,
            max_iterations,
            context: ContextBuilder::new(&config.workspace),
            sessions: SessionManager::new(&config.workspace),
            tools,
            message_tool,
            cron_tool,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Drain the inbound queue until cancellation. A failed message becomes
    /// an error outbound; the loop itself keeps going.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let msg = match self.bus.consume_inbound(&cancel).await {
                Ok(m) => m,
                Err(BusError::Cancelled) | Err(BusError::Closed) => return,
                Err(e) => {
                    warn!("Inbound consume error: {e}");
                    continue;
                }
            };

            match self.process_message(&msg).await {
                Ok(response) => {
                    if let Err(e) = self.bus.publish_outbound(response) {
                        warn!("Dropping outbound reply: {e}");
                    }
                }
                Err(e) => {
                    warn!("Agent failed on {}: {e}", msg.session_key);
                    let err_out =
                        OutboundMessage::new(&msg.channel, &msg.chat_id, &format!("Error: {e}"));
                    if let Err(e) = self.bus.publish_outbound(err_out) {
                        warn!("Dropping error outbound: {e}");
                    }
                }
            }
        }
    }

    /// Core reasoning for one inbound record.
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        info!(
            "inbound channel={} chat={} sender={}",
            msg.channel, msg.chat_id, msg.sender_id
        );

        self.message_tool.set_context(&msg.channel, &msg.chat_id).await;
        if let Some(cron_tool) = &self.cron_tool {
            cron_tool.set_context(&msg.channel, &msg.chat_id).await;
        }

        let session = self.sessions.get_or_create(&msg.session_key);
        let history: Vec<Message> = session
            .messages
            .iter()
            .map(|m| Message::text(&m.role, &m.content))
            .collect();

        let mut messages = self.context.build_messages(
            &history,
            &msg.content,
            msg.media.as_ref(),
            &msg.channel,
            &msg.chat_id,
        );
        let tool_defs = self.tools.definitions();
        let echo = msg.channel == "cli";

        let mut final_content = String::new();

        for iteration in 0..self.max_iterations {
            let mut collector = StreamCollector::new(echo);
            self.provider
                .chat_stream(&messages, &tool_defs, &self.model, &mut collector)
                .await
                .map_err(|e| anyhow::anyhow!("LLM stream error: {e}"))?;

            if echo {
                println!();
            }

            let (content, tool_calls) = collector.into_parts();

            // Keep the latest streamed text: if the iteration cap trips, the
            // last collected content still goes out.
            final_content = content.clone();

            if tool_calls.is_empty() {
                break;
            }

            debug!(
                "iteration {}/{}: {} tool call(s)",
                iteration + 1,
                self.max_iterations,
                tool_calls.len()
            );

            messages.push(Message {
                role: "assistant".into(),
                content,
                tool_call_id: None,
                tool_calls: tool_calls.clone(),
            });

            for call in &tool_calls {
                let args: serde_json::Value = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| serde_json::json!({}));

                let result = match self.tools.execute(&call.function.name, args).await {
                    Ok(r) => r,
                    Err(e) => format!("Error: {e}"),
                };

                info!(
                    "tool name={} result_len={}",
                    call.function.name,
                    result.len()
                );
                if echo {
                    println!("[Result: {}]\n{}\n", call.function.name, result);
                }

                messages.push(Message {
                    role: "tool".into(),
                    content: result,
                    tool_call_id: Some(call.id.clone()),
                    tool_calls: Vec::new(),
                });
            }
        }

        if final_content.is_empty() {
            final_content = "I've completed processing but have no response to give.".into();
        }

        self.sessions.append(&msg.session_key, "user", &msg.content)?;
        self.sessions
            .append(&msg.session_key, "assistant", &final_content)?;

        info!(
            "outbound channel={} chat={} len={}",
            msg.channel,
            msg.chat_id,
            final_content.len()
        );
        Ok(OutboundMessage::new(&msg.channel, &msg.chat_id, &final_content))
    }

    /// Synthesize an inbound record and process it inline.
    ///
    /// Returns the empty string for the interactive terminal channel, whose
    /// content was already streamed to stdout.
    pub async fn process_direct(
        &self,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String> {
        let mut msg = InboundMessage::new(channel, "user", chat_id, content);
        msg.session_key = session_key.to_string();

        let response = self.process_message(&msg).await?;
        if channel == "cli" {
            return Ok(String::new());
        }
        Ok(response.content)
    }
}

/// Adapter so a tool shared with the loop (for `set_context`) can also live
/// in the registry.
struct SharedTool<T: Tool>(Arc<T>);

#[async_trait]
impl<T: Tool> Tool for SharedTool<T> {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn description(&self) -> &str {
        self.0.description()
    }
    fn parameters_schema(&self) -> serde_json::Value {
        self.0.parameters_schema()
    }
    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        self.0.execute(params).await
    }
}

/// Buffers one model stream: text fragments plus reconstructed tool calls.
struct StreamCollector {
    content: String,
    completed: Vec<ToolCall>,
    pending: HashMap<String, ToolCall>,
    echo: bool,
}

impl StreamCollector {
    fn new(echo: bool) -> Self {
        Self {
            content: String::new(),
            completed: Vec::new(),
            pending: HashMap::new(),
            echo,
        }
    }

    fn into_parts(self) -> (String, Vec<ToolCall>) {
        (self.content, self.completed)
    }
}

impl StreamHandler for StreamCollector {
    fn on_content(&mut self, token: &str) {
        self.content.push_str(token);
        if self.echo {
            print!("{token}");
            use std::io::Write;
            let _ = std::io::stdout().flush();
        }
    }

    fn on_tool_call_start(&mut self, id: &str, name: &str) {
        self.pending.insert(
            id.to_string(),
            ToolCall {
                id: id.to_string(),
                kind: "function".into(),
                function: ToolCallFunction {
                    name: name.to_string(),
                    arguments: String::new(),
                },
            },
        );
        if self.echo {
            println!("\n[Tool: {name}]");
        }
    }

    fn on_tool_call_delta(&mut self, id: &str, fragment: &str) {
        if let Some(call) = self.pending.get_mut(id) {
            call.function.arguments.push_str(fragment);
        }
    }

    fn on_tool_call_end(&mut self, id: &str) {
        if let Some(call) = self.pending.remove(id) {
            self.completed.push(call);
        }
    }

    fn on_error(&mut self, err: &anyhow::Error) {
        warn!("stream error: {err}");
    }
}
