use std::path::{Path, PathBuf};

use chrono::Local;

use crate::agent::skills;
use crate::bus::MediaAttachment;
use crate::provider::Message;

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.md");
const ENVIRONMENT_TEMPLATE: &str = include_str!("prompts/environment.md");

/// Workspace files folded into the system prompt, with their headings.
const BOOTSTRAP_FILES: &[(&str, &str)] = &[
    ("AGENTS.md", "## Agent Instructions"),
    ("SOUL.md", "## Personality"),
    ("USER.md", "## User Information"),
    ("memory/MEMORY.md", "## Long-term Memory"),
];

/// Assembles the model message list for one agent iteration.
pub struct ContextBuilder {
    workspace: PathBuf,
}

impl ContextBuilder {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
        }
    }

    /// Build system prompt + history + current user message.
    pub fn build_messages(
        &self,
        history: &[Message],
        current_message: &str,
        media: Option<&MediaAttachment>,
        channel: &str,
        chat_id: &str,
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);

        messages.push(Message::text(
            "system",
            &self.build_system_prompt(channel, chat_id, current_message),
        ));
        messages.extend(history.iter().cloned());

        let content = match media {
            Some(m) => format!("[Media: {}] {current_message}", m.kind),
            None => current_message.to_string(),
        };
        messages.push(Message::text("user", &content));

        messages
    }

    fn build_system_prompt(&self, channel: &str, chat_id: &str, current_message: &str) -> String {
        let mut parts = vec![SYSTEM_PROMPT_TEMPLATE.trim_end().to_string()];

        for (file, heading) in BOOTSTRAP_FILES {
            let path = self.workspace.join(file);
            if let Ok(content) = std::fs::read_to_string(&path) {
                parts.push(format!("{heading}\n{content}"));
            }
        }

        let loaded = skills::load_skills(&self.workspace.join("skills"));
        let selected = skills::filter_skills_by_refs(loaded, current_message);
        let skills_section = skills::build_skills_section(&selected);
        if !skills_section.is_empty() {
            parts.push(skills_section);
        }

        parts.push(build_environment_section(channel, chat_id));

        parts.join("\n\n")
    }
}

fn build_environment_section(channel: &str, chat_id: &str) -> String {
    let now = Local::now();
    let weekday = now.format("%A").to_string();

    ENVIRONMENT_TEMPLATE
        .replace("{{CURRENT_DATE}}", &now.format("%Y-%m-%d %H:%M:%S %Z").to_string())
        .replace("{{CURRENT_DATE_SHORT}}", &now.format("%Y-%m-%d").to_string())
        .replace("{{YEAR}}", &now.format("%Y").to_string())
        .replace(
            "{{MONTH}}",
            &format!("{} ({})", now.format("%-m"), now.format("%B")),
        )
        .replace("{{DAY}}", &format!("{} ({weekday})", now.format("%-d")))
        .replace("{{WEEKDAY}}", &weekday)
        .replace("{{TIME}}", &now.format("%H:%M").to_string())
        .replace("{{CHANNEL}}", channel)
        .replace("{{CHAT_ID}}", chat_id)
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_comes_first() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ContextBuilder::new(dir.path());

        let messages = builder.build_messages(&[], "hello", None, "cli", "direct");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("nanobot"));
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "hello");
    }

    #[test]
    fn bootstrap_files_appear_under_headings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "agent rules here").unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory/MEMORY.md"), "remembered fact").unwrap();

        let builder = ContextBuilder::new(dir.path());
        let messages = builder.build_messages(&[], "hi", None, "cli", "direct");
        let system = &messages[0].content;

        assert!(system.contains("## Agent Instructions\nagent rules here"));
        assert!(system.contains("## Long-term Memory\nremembered fact"));
        // Missing files are skipped silently.
        assert!(!system.contains("## Personality"));
    }

    #[test]
    fn environment_block_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ContextBuilder::new(dir.path());
        let messages = builder.build_messages(&[], "hi", None, "telegram", "42");
        let system = &messages[0].content;

        assert!(system.contains("Channel: telegram"));
        assert!(system.contains("Chat ID: 42"));
        assert!(!system.contains("{{"));
    }

    #[test]
    fn history_preserved_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ContextBuilder::new(dir.path());
        let history = vec![
            Message::text("user", "first"),
            Message::text("assistant", "second"),
        ];

        let messages = builder.build_messages(&history, "third", None, "cli", "direct");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content, "first");
        assert_eq!(messages[2].content, "second");
        assert_eq!(messages[3].content, "third");
    }

    #[test]
    fn media_prefixes_user_message() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ContextBuilder::new(dir.path());
        let media = MediaAttachment {
            kind: "image".into(),
            url: String::new(),
            mime: "image/png".into(),
        };

        let messages = builder.build_messages(&[], "look at this", Some(&media), "cli", "d");
        assert_eq!(messages.last().unwrap().content, "[Media: image] look at this");

        // Empty text still yields a media-prefixed user message.
        let messages = builder.build_messages(&[], "", Some(&media), "cli", "d");
        assert!(messages.last().unwrap().content.starts_with("[Media: image]"));
    }

    #[test]
    fn skills_folded_into_system_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let skills_dir = dir.path().join("skills");
        std::fs::create_dir_all(&skills_dir).unwrap();
        std::fs::write(skills_dir.join("greet.md"), "# Greeting\nAlways say hi.").unwrap();

        let builder = ContextBuilder::new(dir.path());

        let messages = builder.build_messages(&[], "hello", None, "cli", "d");
        assert!(messages[0].content.contains("### Greeting"));

        let messages = builder.build_messages(&[], "hello @skill:none", None, "cli", "d");
        assert!(!messages[0].content.contains("### Greeting"));
    }
}
