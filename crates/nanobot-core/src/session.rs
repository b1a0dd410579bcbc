use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Hard cap on stored turns per session; older entries are evicted.
const MAX_MESSAGES: usize = 50;

/// A single turn in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A conversation session keyed by `channel:chat_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            messages: Vec::new(),
        }
    }

    pub fn add_message(&mut self, role: &str, content: &str) {
        self.messages.push(Message {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        });
        if self.messages.len() > MAX_MESSAGES {
            let excess = self.messages.len() - MAX_MESSAGES;
            self.messages.drain(..excess);
        }
    }
}

/// Summary row for the Web UI session list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub key: String,
    pub message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<String>,
}

/// Concurrent session store backed by one JSON file per key under
/// `<workspace>/.sessions/`.
pub struct SessionManager {
    sessions_dir: PathBuf,
    cache: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(workspace: &std::path::Path) -> Self {
        Self {
            sessions_dir: workspace.join(".sessions"),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.json", sanitize_key(key)))
    }

    /// Return a snapshot of the session, loading from disk or creating it.
    pub fn get_or_create(&self, key: &str) -> Session {
        let mut cache = self.cache.lock().expect("session cache poisoned");
        if let Some(session) = cache.get(key) {
            return session.clone();
        }
        let session = self.load(key).unwrap_or_else(|| Session::new(key));
        cache.insert(key.to_string(), session.clone());
        session
    }

    /// Append a turn, enforce the tail window and persist.
    pub fn append(&self, key: &str, role: &str, content: &str) -> Result<()> {
        let session = {
            let mut cache = self.cache.lock().expect("session cache poisoned");
            let session = cache
                .entry(key.to_string())
                .or_insert_with(|| self.load(key).unwrap_or_else(|| Session::new(key)));
            session.add_message(role, content);
            session.clone()
        };
        self.persist(&session)
    }

    /// Drop all turns for a key and persist the empty session.
    pub fn clear(&self, key: &str) -> Result<()> {
        let session = {
            let mut cache = self.cache.lock().expect("session cache poisoned");
            let session = cache
                .entry(key.to_string())
                .or_insert_with(|| Session::new(key));
            session.messages.clear();
            session.clone()
        };
        self.persist(&session)
    }

    /// List persisted sessions, most recently active first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let entries = match std::fs::read_dir(&self.sessions_dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut results = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match std::fs::read_to_string(&path) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let session: Session = match serde_json::from_str(&data) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let last = session.messages.last();
            results.push(SessionSummary {
                key: session.key.clone(),
                message_count: session.messages.len(),
                last_message: last.map(|m| m.content.clone()),
                last_message_at: last.map(|m| m.timestamp.to_rfc3339()),
            });
        }

        results.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        results
    }

    fn load(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        let data = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&data) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Discarding corrupt session file {}: {e}", path.display());
                None
            }
        }
    }

    fn persist(&self, session: &Session) -> Result<()> {
        std::fs::create_dir_all(&self.sessions_dir).with_context(|| {
            format!(
                "failed to create sessions dir '{}'",
                self.sessions_dir.display()
            )
        })?;
        let path = self.session_path(&session.key);
        let data = serde_json::to_string_pretty(session)?;
        std::fs::write(&path, data)
            .with_context(|| format!("failed to write session '{}'", path.display()))?;
        Ok(())
    }
}

/// Replace characters outside `[A-Za-z0-9_-]` with `_`.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
