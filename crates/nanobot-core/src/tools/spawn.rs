use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::Tool;

/// Callback fired when a background task starts and completes.
pub type SpawnCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SpawnTask {
    pub id: String,
    pub label: String,
    pub task: String,
}

/// Registers short-lived background task records. Task state is in-memory
/// only; this is a hook point, not a durable queue.
pub struct SpawnTool {
    callback: Option<SpawnCallback>,
    running: Arc<Mutex<HashMap<String, SpawnTask>>>,
}

impl SpawnTool {
    pub fn new(callback: Option<SpawnCallback>) -> Self {
        Self {
            callback,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn running_tasks(&self) -> Vec<SpawnTask> {
        self.running.lock().await.values().cloned().collect()
    }
}

fn task_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("task_{nanos}")
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to handle a task in the background. Use for complex or \
         time-consuming tasks that can run independently."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task for the subagent to complete",
                    "minLength": 1
                },
                "label": {
                    "type": "string",
                    "description": "Optional short label for the task (for display)"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let task = params
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: task"))?;

        let label = params
            .get("label")
            .and_then(|v| v.as_str())
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .unwrap_or_else(|| task.chars().take(30).collect());

        let id = task_id();
        let record = SpawnTask {
            id: id.clone(),
            label: label.clone(),
            task: task.to_string(),
        };

        self.running.lock().await.insert(id.clone(), record);

        let callback = self.callback.clone();
        let running = self.running.clone();
        let task_text = task.to_string();
        let task_label = label.clone();
        let task_key = id.clone();
        tokio::spawn(async move {
            if let Some(cb) = &callback {
                cb(format!("[Subagent {task_key}] Started: {task_text}"));
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            running.lock().await.remove(&task_key);
            if let Some(cb) = &callback {
                cb(format!("[Subagent {task_key}] Completed: {task_label}"));
            }
        });

        Ok(format!("Spawned subagent '{label}' (id: {id}) to handle: {task}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn spawn_returns_identifier_and_fires_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let tool = SpawnTool::new(Some(Arc::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        })));

        let result = tool
            .execute(serde_json::json!({"task": "index the docs"}))
            .await
            .unwrap();
        assert!(result.contains("Spawned subagent"));
        assert!(result.contains("task_"));

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(tool.running_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn label_defaults_to_task_prefix() {
        let tool = SpawnTool::new(None);
        let long_task = "a".repeat(60);
        let result = tool
            .execute(serde_json::json!({"task": long_task}))
            .await
            .unwrap();
        assert!(result.contains(&format!("'{}'", "a".repeat(30))));
    }
}
