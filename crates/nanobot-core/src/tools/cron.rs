use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cron::{CronService, Payload, Schedule};
use crate::tools::Tool;

/// Thin facade over the scheduler so the model can manage its own jobs.
pub struct CronTool {
    service: Arc<CronService>,
    default_channel: Arc<RwLock<String>>,
    default_chat_id: Arc<RwLock<String>>,
}

impl CronTool {
    pub fn new(service: Arc<CronService>) -> Self {
        Self {
            service,
            default_channel: Arc::new(RwLock::new(String::new())),
            default_chat_id: Arc::new(RwLock::new(String::new())),
        }
    }

    /// Update the default routing context for job delivery.
    pub async fn set_context(&self, channel: &str, chat_id: &str) {
        *self.default_channel.write().await = channel.to_string();
        *self.default_chat_id.write().await = chat_id.to_string();
    }

    async fn handle_add(&self, params: &serde_json::Value) -> Result<String> {
        let message = match params.get("message").and_then(|v| v.as_str()) {
            Some(m) if !m.is_empty() => m,
            _ => return Ok("Error: message is required for add action".into()),
        };

        let schedule = if let Some(secs) = params.get("every_seconds").and_then(|v| v.as_i64()) {
            if secs <= 0 {
                return Ok("Error: every_seconds must be positive".into());
            }
            Schedule::Every {
                every_ms: secs * 1000,
            }
        } else if let Some(expr) = params.get("cron_expr").and_then(|v| v.as_str()) {
            if expr.is_empty() {
                return Ok("Error: cron_expr must not be empty".into());
            }
            Schedule::Cron {
                expr: expr.to_string(),
            }
        } else {
            return Ok("Error: either every_seconds or cron_expr is required".into());
        };

        let channel = self.default_channel.read().await.clone();
        let chat_id = self.default_chat_id.read().await.clone();
        if channel.is_empty() || chat_id.is_empty() {
            return Ok("Error: no session context (channel/chat_id)".into());
        }

        let name: String = if message.chars().count() > 30 {
            let prefix: String = message.chars().take(30).collect();
            format!("{prefix}...")
        } else {
            message.to_string()
        };

        let payload = Payload {
            message: message.to_string(),
            channel: Some(channel),
            to: Some(chat_id),
            deliver: true,
        };

        match self.service.add_job(&name, schedule, payload).await {
            Ok(job) => Ok(format!("Created job '{}' (id: {})", job.name, job.id)),
            Err(e) => Ok(format!("Error: failed to add job: {e}")),
        }
    }

    async fn handle_list(&self) -> Result<String> {
        let jobs = self.service.list_jobs().await;
        if jobs.is_empty() {
            return Ok("No scheduled jobs.".into());
        }

        let mut out = String::from("Scheduled jobs:\n");
        for (i, job) in jobs.iter().enumerate() {
            let schedule = match &job.schedule {
                Schedule::Every { every_ms } => format!("every {} seconds", every_ms / 1000),
                Schedule::Cron { expr } => format!("cron: {expr}"),
                Schedule::Once { at_ms } => chrono::DateTime::from_timestamp_millis(*at_ms)
                    .map(|dt| format!("at {}", dt.format("%Y-%m-%d %H:%M:%S UTC")))
                    .unwrap_or_else(|| "at ?".into()),
            };
            let status = if job.enabled { "enabled" } else { "disabled" };
            out.push_str(&format!(
                "{}. {} (id: {}, {}, {})\n",
                i + 1,
                job.name,
                job.id,
                schedule,
                status
            ));
        }
        Ok(out)
    }

    async fn handle_remove(&self, params: &serde_json::Value) -> Result<String> {
        let job_id = match params.get("job_id").and_then(|v| v.as_str()) {
            Some(id) if !id.is_empty() => id,
            _ => return Ok("Error: job_id is required for remove action".into()),
        };

        if self.service.remove_job(job_id).await {
            Ok(format!("Removed job {job_id}"))
        } else {
            Ok(format!("Error: job {job_id} not found"))
        }
    }
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Schedule reminders and recurring tasks. Actions: add, list, remove. Use for \
         setting up reminders, periodic checks, or scheduled notifications."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "remove"],
                    "description": "Action to perform"
                },
                "message": {
                    "type": "string",
                    "description": "Reminder message (required for add)"
                },
                "every_seconds": {
                    "type": "integer",
                    "description": "Interval in seconds (for recurring tasks, e.g. 3600 for hourly)",
                    "minimum": 1
                },
                "cron_expr": {
                    "type": "string",
                    "description": "Cron expression like '0 9 * * *' for daily at 9am"
                },
                "job_id": {
                    "type": "string",
                    "description": "Job ID (required for remove)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let action = params
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: action"))?;

        match action {
            "add" => self.handle_add(&params).await,
            "list" => self.handle_list().await,
            "remove" => self.handle_remove(&params).await,
            other => Ok(format!("Error: unknown action: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_with_store(dir: &std::path::Path) -> (CronTool, Arc<CronService>) {
        let service = CronService::new(dir.join("jobs.json"));
        (CronTool::new(service.clone()), service)
    }

    #[tokio::test]
    async fn add_requires_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _service) = tool_with_store(dir.path());
        tool.set_context("cli", "direct").await;

        let result = tool
            .execute(serde_json::json!({"action": "add", "message": "water plants"}))
            .await
            .unwrap();
        assert!(result.contains("every_seconds or cron_expr"));
    }

    #[tokio::test]
    async fn add_every_creates_delivering_job() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, service) = tool_with_store(dir.path());
        tool.set_context("telegram", "42").await;

        let result = tool
            .execute(serde_json::json!({
                "action": "add",
                "message": "water plants",
                "every_seconds": 3600
            }))
            .await
            .unwrap();
        assert!(result.contains("Created job"));

        let jobs = service.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].schedule, Schedule::Every { every_ms: 3_600_000 });
        assert!(jobs[0].payload.deliver);
        assert_eq!(jobs[0].payload.channel.as_deref(), Some("telegram"));
        assert_eq!(jobs[0].payload.to.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn add_without_context_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _service) = tool_with_store(dir.path());

        let result = tool
            .execute(serde_json::json!({
                "action": "add",
                "message": "x",
                "every_seconds": 60
            }))
            .await
            .unwrap();
        assert!(result.contains("no session context"));
    }

    #[tokio::test]
    async fn list_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, service) = tool_with_store(dir.path());
        tool.set_context("cli", "direct").await;

        assert_eq!(
            tool.execute(serde_json::json!({"action": "list"}))
                .await
                .unwrap(),
            "No scheduled jobs."
        );

        tool.execute(serde_json::json!({
            "action": "add",
            "message": "check mail",
            "cron_expr": "0 9 * * *"
        }))
        .await
        .unwrap();

        let listing = tool
            .execute(serde_json::json!({"action": "list"}))
            .await
            .unwrap();
        assert!(listing.contains("check mail"));
        assert!(listing.contains("cron: 0 9 * * *"));

        let id = service.list_jobs().await[0].id.clone();
        let result = tool
            .execute(serde_json::json!({"action": "remove", "job_id": id}))
            .await
            .unwrap();
        assert!(result.contains("Removed job"));
        assert!(service.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn long_message_truncated_into_name() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, service) = tool_with_store(dir.path());
        tool.set_context("cli", "direct").await;

        let message = "m".repeat(50);
        tool.execute(serde_json::json!({
            "action": "add",
            "message": message,
            "every_seconds": 60
        }))
        .await
        .unwrap();

        let jobs = service.list_jobs().await;
        assert_eq!(jobs[0].name, format!("{}...", "m".repeat(30)));
        assert_eq!(jobs[0].payload.message.len(), 50);
    }
}
