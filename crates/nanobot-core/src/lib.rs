pub mod agent;
pub mod bus;
pub mod cron;
pub mod provider;
pub mod session;
pub mod tools;

pub use agent::{AgentConfig, AgentLoop, ContextBuilder};
pub use bus::{BusError, InboundMessage, MediaAttachment, MessageBus, OutboundMessage};
pub use cron::{CronService, Job, Payload, Schedule};
pub use provider::{LlmProvider, OpenAiProvider};
pub use session::{Session, SessionManager};
pub use tools::ToolRegistry;
