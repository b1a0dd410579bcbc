use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use super::Tool;

/// Resolve a path, expanding ~ and enforcing the optional sandbox root.
fn resolve_path(path: &str, allowed_dir: Option<&Path>) -> std::result::Result<PathBuf, String> {
    let expanded = if path.starts_with("~/") || path == "~" {
        dirs::home_dir()
            .map(|h| h.join(path.strip_prefix("~/").unwrap_or("")))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    };

    let resolved = expanded
        .canonicalize()
        .unwrap_or_else(|_| std::path::absolute(&expanded).unwrap_or(expanded));

    if let Some(allowed) = allowed_dir {
        let allowed_resolved = allowed
            .canonicalize()
            .unwrap_or_else(|_| allowed.to_path_buf());
        if !resolved.starts_with(&allowed_resolved) {
            return Err(format!(
                "path {path} is outside workspace {}",
                allowed.display()
            ));
        }
    }

    Ok(resolved)
}

// ---------------------------------------------------------------------------
// ReadFileTool
// ---------------------------------------------------------------------------

pub struct ReadFileTool {
    allowed_dir: Option<PathBuf>,
}

impl ReadFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Use for viewing code, logs, or any text file."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line to start reading from (1-indexed, optional)",
                    "minimum": 1
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read (optional)",
                    "minimum": 1,
                    "maximum": 1000
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;

        let file_path = match resolve_path(path, self.allowed_dir.as_deref()) {
            Ok(p) => p,
            Err(e) => return Ok(format!("Error: {e}")),
        };

        let content = match std::fs::read_to_string(&file_path) {
            Ok(c) => c,
            Err(e) => return Ok(format!("Error reading file: {e}")),
        };

        let offset = params.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(0) as usize;

        if offset == 0 && limit == 0 {
            return Ok(content);
        }

        let lines: Vec<&str> = content.split('\n').collect();
        let start = offset.saturating_sub(1);
        if start >= lines.len() {
            return Ok("Error: offset exceeds file length".to_string());
        }

        let mut selected = &lines[start..];
        if limit > 0 && limit < selected.len() {
            selected = &selected[..limit];
        }

        Ok(selected.join("\n"))
    }
}

// ---------------------------------------------------------------------------
// WriteFileTool
// ---------------------------------------------------------------------------

pub struct WriteFileTool {
    allowed_dir: Option<PathBuf>,
}

impl WriteFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it and any parent directories. Overwrites existing content."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;

        let file_path = match resolve_path(path, self.allowed_dir.as_deref()) {
            Ok(p) => p,
            Err(e) => return Ok(format!("Error: {e}")),
        };

        if let Some(parent) = file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return Ok(format!("Error creating directories: {e}"));
            }
        }

        // Write to a sibling temp file, then rename into place.
        let tmp_path = file_path.with_extension("tmp.nanobot");
        if let Err(e) = std::fs::write(&tmp_path, content) {
            return Ok(format!("Error writing file: {e}"));
        }
        if let Err(e) = std::fs::rename(&tmp_path, &file_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Ok(format!("Error writing file: {e}"));
        }

        Ok(format!("File written successfully: {}", file_path.display()))
    }
}

// ---------------------------------------------------------------------------
// EditFileTool
// ---------------------------------------------------------------------------

pub struct EditFileTool {
    allowed_dir: Option<PathBuf>,
}

impl EditFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing old_string with new_string. The replacement happens exactly once."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "Text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "New text to insert"
                }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;
        let old_string = params
            .get("old_string")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: old_string"))?;
        let new_string = params
            .get("new_string")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: new_string"))?;

        let file_path = match resolve_path(path, self.allowed_dir.as_deref()) {
            Ok(p) => p,
            Err(e) => return Ok(format!("Error: {e}")),
        };

        let content = match std::fs::read_to_string(&file_path) {
            Ok(c) => c,
            Err(e) => return Ok(format!("Error reading file: {e}")),
        };

        if !content.contains(old_string) {
            return Ok("Error: old_string not found in file".to_string());
        }

        let new_content = content.replacen(old_string, new_string, 1);
        match std::fs::write(&file_path, new_content) {
            Ok(()) => Ok(format!("File edited successfully: {}", file_path.display())),
            Err(e) => Ok(format!("Error writing file: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ListDirTool
// ---------------------------------------------------------------------------

pub struct ListDirTool {
    allowed_dir: Option<PathBuf>,
}

impl ListDirTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }

    fn list_dir(base: &Path, prefix: &str, recursive: bool, out: &mut String) {
        let entries = match std::fs::read_dir(base) {
            Ok(e) => e,
            Err(e) => {
                out.push_str(&format!("Error reading directory: {e}\n"));
                return;
            }
        };

        let mut items: Vec<_> = entries.flatten().collect();
        items.sort_by_key(|e| e.file_name());

        for item in items {
            let name = item.file_name().to_string_lossy().into_owned();
            if item.path().is_dir() {
                out.push_str(&format!("{prefix}[DIR]  {name}/\n"));
                if recursive {
                    Self::list_dir(&item.path(), &format!("{prefix}  "), recursive, out);
                }
            } else {
                let size = item
                    .metadata()
                    .map(|m| format!(" ({} bytes)", m.len()))
                    .unwrap_or_default();
                out.push_str(&format!("{prefix}[FILE] {name}{size}\n"));
            }
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List files and directories at a path. Use to explore directory structure."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the directory to list"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Whether to list recursively (default: false)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or(".");
        let recursive = params
            .get("recursive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let dir_path = match resolve_path(path, self.allowed_dir.as_deref()) {
            Ok(p) => p,
            Err(e) => return Ok(format!("Error: {e}")),
        };

        if !dir_path.is_dir() {
            return Ok(format!("Error: not a directory: {path}"));
        }

        let mut out = String::new();
        Self::list_dir(&dir_path, "", recursive, &mut out);
        Ok(out)
    }
}
