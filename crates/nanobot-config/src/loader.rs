use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::Config;

/// Directory that holds config, logs and the default workspace.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".nanobot"))
        .unwrap_or_else(|| PathBuf::from(".nanobot"))
}

/// Path of the config file: `~/.nanobot/config.json`.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration, falling back to defaults when the file is absent.
/// The workspace path is expanded (`~`, `$HOME` and friends) at load time.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config '{}'", path.display()))?
    } else {
        Config::default()
    };

    config.agents.defaults.workspace = expand_path(&config.agents.defaults.workspace);
    Ok(config)
}

/// Save configuration as pretty-printed JSON, creating parent directories.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config dir '{}'", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(config)?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config '{}'", path.display()))?;
    Ok(())
}

/// Expand `~` and `$VAR` forms in a path string.
pub fn expand_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }

    let mut expanded = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            expanded.push(c);
            continue;
        }
        let mut name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for v in chars.by_ref() {
                if v == '}' {
                    break;
                }
                name.push(v);
            }
        } else {
            while let Some(&v) = chars.peek() {
                if v.is_ascii_alphanumeric() || v == '_' {
                    name.push(v);
                    chars.next();
                } else {
                    break;
                }
            }
        }
        match std::env::var(&name) {
            Ok(value) => expanded.push_str(&value),
            Err(_) => {
                expanded.push('$');
                expanded.push_str(&name);
            }
        }
    }

    if let Some(home) = dirs::home_dir() {
        if expanded == "~" {
            return home.to_string_lossy().into_owned();
        }
        if let Some(rest) = expanded.strip_prefix("~/") {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }

    expanded
}
