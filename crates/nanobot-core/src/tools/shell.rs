use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use super::Tool;

const MAX_OUTPUT_BYTES: usize = 10 * 1024;

/// Shell command execution with a deny-list and an optional workspace jail.
pub struct ExecTool {
    working_dir: PathBuf,
    timeout: Duration,
    restrict_to_workspace: bool,
    deny_patterns: Vec<Regex>,
}

impl ExecTool {
    pub fn new(working_dir: PathBuf, timeout_secs: u64, restrict_to_workspace: bool) -> Self {
        let timeout_secs = if timeout_secs == 0 { 60 } else { timeout_secs };

        // Destructive idioms blocked regardless of sandbox mode.
        let deny_patterns: Vec<Regex> = [
            r"rm\s+-rf\s+/",
            r"mkfs\.",
            r"\bformat\b.*/dev/",
            r"dd\s+if=.*of=/dev/",
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            r">\s*/dev/sd",
            r">\s*/dev/hd",
            r"chmod\s+-r\s+000\s+/",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

        Self {
            working_dir,
            timeout: Duration::from_secs(timeout_secs),
            restrict_to_workspace,
            deny_patterns,
        }
    }

    fn check_dangerous(&self, command: &str) -> Option<String> {
        let lower = command.to_lowercase();
        for re in &self.deny_patterns {
            if re.is_match(&lower) {
                return Some(format!(
                    "Error: dangerous command detected: pattern '{re}' matched"
                ));
            }
        }
        None
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute shell commands. Use for running code, managing files, or system operations. \
         Command timeout is enforced."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (optional, default: 60)",
                    "minimum": 1,
                    "maximum": 300
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let command = params
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: command"))?;

        if let Some(msg) = self.check_dangerous(command) {
            return Ok(msg);
        }

        if self.restrict_to_workspace {
            if self.working_dir.as_os_str().is_empty() {
                return Ok(
                    "Error: restrictToWorkspace enabled but working directory is empty".into(),
                );
            }
            if let Err(e) = validate_command_in_workspace(command, &self.working_dir) {
                return Ok(format!("Error: {e}"));
            }
        }

        let timeout = params
            .get("timeout")
            .and_then(|v| v.as_u64())
            .filter(|&t| t > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if !self.working_dir.as_os_str().is_empty() {
            cmd.current_dir(&self.working_dir);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return Ok(format!("Command failed: {e}")),
        };

        // Drain pipes into shared buffers so partial output survives a kill,
        // even when a grandchild keeps the pipe open.
        let (stdout_buf, out_task) = drain_pipe(child.stdout.take());
        let (stderr_buf, err_task) = drain_pipe(child.stderr.take());

        let status = tokio::time::timeout(timeout, child.wait()).await;
        let timed_out = status.is_err();
        if timed_out {
            let _ = child.kill().await;
        }

        let grace = if timed_out {
            Duration::from_millis(200)
        } else {
            Duration::from_secs(5)
        };
        for task in [out_task, err_task].into_iter().flatten() {
            let _ = tokio::time::timeout(grace, task).await;
        }

        let mut combined = String::from_utf8_lossy(&stdout_buf.lock().await).into_owned();
        combined.push_str(&String::from_utf8_lossy(&stderr_buf.lock().await));
        let truncated = truncate_output(&combined);

        if timed_out {
            return Ok(format!(
                "Command timed out after {}s\nPartial output:\n{truncated}",
                timeout.as_secs()
            ));
        }

        match status {
            Ok(Ok(exit)) if exit.success() => {
                if truncated.is_empty() {
                    Ok("(no output)".to_string())
                } else {
                    Ok(truncated)
                }
            }
            Ok(Ok(exit)) => Ok(format!(
                "Command failed: exit code {}\nOutput:\n{truncated}",
                exit.code().unwrap_or(-1)
            )),
            Ok(Err(e)) => Ok(format!("Command failed: {e}")),
            Err(_) => unreachable!("timeout handled above"),
        }
    }
}

type SharedBuf = std::sync::Arc<tokio::sync::Mutex<Vec<u8>>>;

/// Read a child pipe into a shared buffer until EOF. The buffer stays
/// readable even if the task is still blocked on a lingering grandchild.
fn drain_pipe<R>(pipe: Option<R>) -> (SharedBuf, Option<tokio::task::JoinHandle<()>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let buf: SharedBuf = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let handle = pipe.map(|mut pipe| {
        let buf = buf.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
                }
            }
        })
    });
    (buf, handle)
}

fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output.to_string();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (output truncated)", &output[..end])
}

/// Restricted-mode guard: tokenize with shell quoting, reject expansions
/// that can hide paths, and require every path-like token to resolve inside
/// the workspace. Defense-in-depth over the deny-list, not a full parser.
fn validate_command_in_workspace(command: &str, workspace: &Path) -> std::result::Result<(), String> {
    let ws = clean_abs_path(workspace).map_err(|e| format!("invalid workspace: {e}"))?;

    for token in split_shell_words(command) {
        if token.is_empty() || is_shell_separator(&token) {
            continue;
        }

        if token.contains("$(") || token.contains('`') {
            return Err("command contains unsupported shell expansion in restricted mode".into());
        }

        let trimmed = token.trim_start_matches(['>', '<']);
        if trimmed.is_empty() {
            continue;
        }

        // key=value assignments can smuggle a path on the right side
        if let Some((_, value)) = trimmed.split_once('=') {
            if looks_like_path(value) {
                ensure_path_within(value, &ws)?;
                continue;
            }
        }

        if looks_like_path(trimmed) {
            ensure_path_within(trimmed, &ws)?;
        }
    }

    Ok(())
}

fn looks_like_path(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    token.starts_with('~')
        || token.contains("$HOME")
        || token.contains("${HOME}")
        || token.contains("$USERPROFILE")
        || token.starts_with('.')
        || token.contains('/')
        || token.contains('\\')
}

fn ensure_path_within(token: &str, workspace: &Path) -> std::result::Result<(), String> {
    if token.starts_with('~')
        || token.contains("$HOME")
        || token.contains("${HOME}")
        || token.contains("$USERPROFILE")
    {
        return Err(format!("path '{token}' is not allowed in restricted mode"));
    }

    let candidate = Path::new(token);
    let target = if candidate.is_absolute() {
        clean_abs_path(candidate).map_err(|e| format!("invalid path '{token}': {e}"))?
    } else {
        clean_abs_path(&workspace.join(candidate))
            .map_err(|e| format!("invalid path '{token}': {e}"))?
    };

    if !target.starts_with(workspace) {
        return Err(format!("path '{token}' is outside workspace"));
    }
    Ok(())
}

/// Absolutize and lexically normalize, resolving symlinks when possible.
fn clean_abs_path(path: &Path) -> std::io::Result<PathBuf> {
    let abs = std::path::absolute(path)?;
    if let Ok(resolved) = abs.canonicalize() {
        return Ok(resolved);
    }

    // Target may not exist yet; normalize . and .. components lexically.
    let mut normalized = PathBuf::new();
    for component in abs.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

fn split_shell_words(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut buf = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escape = false;

    for c in input.chars() {
        if escape {
            buf.push(c);
            escape = false;
            continue;
        }
        match c {
            '\\' if !in_single => escape = true,
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            c if c.is_whitespace() && !in_single && !in_double => {
                if !buf.is_empty() {
                    tokens.push(std::mem::take(&mut buf));
                }
            }
            c => buf.push(c),
        }
    }
    if !buf.is_empty() {
        tokens.push(buf);
    }
    tokens
}

fn is_shell_separator(token: &str) -> bool {
    matches!(token, "|" | "||" | "&" | "&&" | ";")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted(dir: &Path) -> ExecTool {
        ExecTool::new(dir.to_path_buf(), 10, true)
    }

    fn unrestricted(dir: &Path) -> ExecTool {
        ExecTool::new(dir.to_path_buf(), 10, false)
    }

    // --- deny-list ---

    #[tokio::test]
    async fn rm_rf_root_rejected_even_unrestricted() {
        let dir = tempfile::tempdir().unwrap();
        let tool = unrestricted(dir.path());
        let result = tool
            .execute(serde_json::json!({"command": "rm -rf /"}))
            .await
            .unwrap();
        assert!(result.contains("dangerous command"));
    }

    #[tokio::test]
    async fn fork_bomb_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = unrestricted(dir.path());
        let result = tool
            .execute(serde_json::json!({"command": ":(){ :|:& };:"}))
            .await
            .unwrap();
        assert!(result.contains("dangerous command"));
    }

    #[tokio::test]
    async fn dd_to_device_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = unrestricted(dir.path());
        let result = tool
            .execute(serde_json::json!({"command": "dd if=/dev/zero of=/dev/sda"}))
            .await
            .unwrap();
        assert!(result.contains("dangerous command"));
    }

    // --- restricted-mode tokenizer ---

    #[tokio::test]
    async fn restricted_rejects_absolute_path_outside() {
        let dir = tempfile::tempdir().unwrap();
        let tool = restricted(dir.path());
        let result = tool
            .execute(serde_json::json!({"command": "cat /etc/passwd"}))
            .await
            .unwrap();
        assert!(result.contains("outside workspace"));
    }

    #[tokio::test]
    async fn restricted_rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let tool = restricted(dir.path());
        let result = tool
            .execute(serde_json::json!({"command": "cd .. && ls"}))
            .await
            .unwrap();
        assert!(result.contains("outside workspace"));
    }

    #[tokio::test]
    async fn restricted_rejects_home_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let tool = restricted(dir.path());
        for cmd in ["ls ~", "ls $HOME", "echo ${HOME}/x", "dir $USERPROFILE"] {
            let result = tool
                .execute(serde_json::json!({"command": cmd}))
                .await
                .unwrap();
            assert!(result.contains("not allowed in restricted mode"), "{cmd}: {result}");
        }
    }

    #[tokio::test]
    async fn restricted_rejects_command_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let tool = restricted(dir.path());
        let result = tool
            .execute(serde_json::json!({"command": "cat $(find / -name passwd)"}))
            .await
            .unwrap();
        assert!(result.contains("shell expansion"));

        let result = tool
            .execute(serde_json::json!({"command": "echo `ls /`"}))
            .await
            .unwrap();
        assert!(result.contains("shell expansion"));
    }

    #[tokio::test]
    async fn restricted_allows_workspace_relative_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let tool = restricted(dir.path());
        let result = tool
            .execute(serde_json::json!({"command": "echo ok > file.txt && cat file.txt"}))
            .await
            .unwrap();
        assert_eq!(result.trim(), "ok");
    }

    // --- execution ---

    #[tokio::test]
    async fn captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = unrestricted(dir.path());
        let result = tool
            .execute(serde_json::json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert_eq!(result.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tool = unrestricted(dir.path());
        let result = tool
            .execute(serde_json::json!({"command": "exit 42"}))
            .await
            .unwrap();
        assert!(result.contains("exit code 42"));
    }

    #[tokio::test]
    async fn timeout_returns_notice_with_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(dir.path().to_path_buf(), 1, false);
        let result = tool
            .execute(serde_json::json!({"command": "echo partial; sleep 10"}))
            .await
            .unwrap();
        assert!(result.contains("timed out after 1s"));
        assert!(result.contains("partial"));
    }

    #[tokio::test]
    async fn silent_success_reports_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = unrestricted(dir.path());
        let result = tool
            .execute(serde_json::json!({"command": "true"}))
            .await
            .unwrap();
        assert_eq!(result, "(no output)");
    }

    #[tokio::test]
    async fn output_truncated_at_cap() {
        let dir = tempfile::tempdir().unwrap();
        let tool = unrestricted(dir.path());
        let result = tool
            .execute(serde_json::json!({"command": "head -c 20000 /dev/zero | tr '\\0' 'x'"}))
            .await
            .unwrap();
        assert!(result.len() <= MAX_OUTPUT_BYTES + 40);
        assert!(result.contains("(output truncated)"));
    }

    // --- tokenizer unit tests ---

    #[test]
    fn shell_words_respect_quotes() {
        assert_eq!(
            split_shell_words(r#"echo "a b" c"#),
            vec!["echo", "a b", "c"]
        );
        assert_eq!(split_shell_words("a 'b c' d"), vec!["a", "b c", "d"]);
        assert_eq!(split_shell_words(r"a\ b"), vec!["a b"]);
    }

    #[test]
    fn assignment_paths_checked() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().canonicalize().unwrap();
        assert!(validate_command_in_workspace("CONFIG=/etc/passwd run", &ws).is_err());
        assert!(validate_command_in_workspace("CONFIG=./local run", &ws).is_ok());
    }
}
