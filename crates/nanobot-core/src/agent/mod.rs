pub mod context;
#[allow(clippy::module_inception)]
mod r#loop;
pub mod skills;

pub use context::ContextBuilder;
pub use r#loop::{AgentConfig, AgentLoop};
