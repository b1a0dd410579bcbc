use std::path::Path;

use anyhow::Result;

use nanobot_config::{save_config, Config};

/// Workspace template files created once and never overwritten.
const TEMPLATES: &[(&str, &str)] = &[
    (
        "AGENTS.md",
        "# Agent Instructions\n\n\
         You are a helpful AI assistant. Be concise, accurate, and friendly.\n\n\
         ## Guidelines\n\n\
         - Always explain what you're doing before taking actions\n\
         - Ask for clarification when the request is ambiguous\n\
         - Use tools to help accomplish tasks\n\
         - Remember important information in your memory files\n",
    ),
    (
        "SOUL.md",
        "# Soul\n\n\
         I am nanobot, a lightweight AI assistant.\n\n\
         ## Personality\n\n\
         - Helpful and friendly\n\
         - Concise and to the point\n\
         - Curious and eager to learn\n\n\
         ## Values\n\n\
         - Accuracy over speed\n\
         - User privacy and safety\n\
         - Transparency in actions\n",
    ),
    (
        "USER.md",
        "# User\n\n\
         Information about the user goes here.\n\n\
         ## Preferences\n\n\
         - Communication style: (casual/formal)\n\
         - Timezone: (your timezone)\n\
         - Language: (your preferred language)\n",
    ),
    (
        "skills/README.md",
        "# Skills\n\n\
         Skills are reusable instruction files loaded into the system prompt.\n\
         Put them in this directory as:\n\n\
         - skills/<name>.md\n\
         - skills/<name>/SKILL.md\n\n\
         Reference @skill:<name> in a message to load only that skill.\n",
    ),
    (
        "skills/example/SKILL.md",
        "# Example Skill\n\n\
         When writing responses:\n\
         - Be concise\n\
         - Provide steps\n\
         - Call tools when needed\n",
    ),
    (
        "memory/MEMORY.md",
        "# Long-term Memory\n\n\
         This file stores important information that should persist across sessions.\n\n\
         ## User Information\n\n\
         (Important facts about the user)\n\n\
         ## Preferences\n\n\
         (User preferences learned over time)\n\n\
         ## Important Notes\n\n\
         (Things to remember)\n",
    ),
];

/// Create the config file (if absent) and the workspace template tree.
pub fn run(config_file: &Path, config: &Config) -> Result<()> {
    if !config_file.exists() {
        save_config(config_file, config)?;
        println!("Created config: {}", config_file.display());
    } else {
        println!("Config exists: {}", config_file.display());
    }

    let workspace = Path::new(&config.agents.defaults.workspace);
    std::fs::create_dir_all(workspace)?;

    for (rel, content) in TEMPLATES {
        let path = workspace.join(rel);
        if path.exists() {
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        println!("Created {}", path.display());
    }

    println!("Workspace ready: {}", workspace.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_config_and_templates() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("config.json");

        let mut config = Config::default();
        config.agents.defaults.workspace = dir.path().join("ws").to_string_lossy().into_owned();

        run(&config_file, &config).unwrap();

        assert!(config_file.exists());
        let ws = dir.path().join("ws");
        for (rel, _) in TEMPLATES {
            assert!(ws.join(rel).exists(), "missing template {rel}");
        }
    }

    #[test]
    fn never_overwrites_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("config.json");

        let mut config = Config::default();
        let ws = dir.path().join("ws");
        config.agents.defaults.workspace = ws.to_string_lossy().into_owned();

        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("SOUL.md"), "my custom soul").unwrap();

        run(&config_file, &config).unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.join("SOUL.md")).unwrap(),
            "my custom soul"
        );
    }
}
