use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::Tool;

/// Web search via the Brave Search API.
pub struct WebSearchTool {
    api_key: String,
    max_results: u32,
}

impl WebSearchTool {
    pub fn new(api_key: String, max_results: u32) -> Self {
        Self {
            api_key,
            max_results: if max_results == 0 { 5 } else { max_results },
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Use for finding current information, news, or research topics."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query",
                    "minLength": 1,
                    "maxLength": 500
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results to return (1-10)",
                    "minimum": 1,
                    "maximum": 10
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let query = params
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: query"))?;

        if self.api_key.is_empty() {
            return Ok("Error: web search API key not configured".into());
        }

        let count = params
            .get("count")
            .and_then(|v| v.as_u64())
            .map(|c| (c as u32).min(10))
            .unwrap_or(self.max_results);

        let client = reqwest::Client::new();
        let resp = client
            .get("https://api.search.brave.com/res/v1/web/search")
            .query(&[("q", query), ("count", &count.to_string())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => return Ok(format!("Error: search request failed: {e}")),
        };
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Ok(format!("Error: search API returned status {status}: {body}"));
        }

        let body: serde_json::Value = match resp.json().await {
            Ok(b) => b,
            Err(e) => return Ok(format!("Error: failed to parse search result: {e}")),
        };

        let results = body
            .get("web")
            .and_then(|w| w.get("results"))
            .and_then(|r| r.as_array());
        let results = match results {
            Some(r) if !r.is_empty() => r,
            _ => return Ok(format!("No results found for: {query}")),
        };

        let mut out = format!("Search results for: {query}\n\n");
        for (i, result) in results.iter().enumerate() {
            let title = result.get("title").and_then(|v| v.as_str()).unwrap_or("");
            let url = result.get("url").and_then(|v| v.as_str()).unwrap_or("");
            let desc = result
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            out.push_str(&format!("{}. {title}\n   URL: {url}\n   {desc}\n\n", i + 1));
        }

        Ok(out)
    }
}

/// Options for the fetch tool, from `tools.web.fetch` config.
#[derive(Debug, Clone)]
pub struct WebFetchOptions {
    pub mode: String,
    pub node_path: String,
    pub script_path: String,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub wait_until: String,
}

impl Default for WebFetchOptions {
    fn default() -> Self {
        Self {
            mode: "http".into(),
            node_path: String::new(),
            script_path: String::new(),
            timeout_secs: 30,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .into(),
            wait_until: "domcontentloaded".into(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BrowserFetchRequest {
    url: String,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    user_agent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    wait_until: String,
}

#[derive(Deserialize)]
struct BrowserFetchResult {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    title: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    error: String,
}

/// Fetch a page and extract its readable text.
pub struct WebFetchTool {
    options: WebFetchOptions,
}

impl WebFetchTool {
    pub fn new(mut options: WebFetchOptions) -> Self {
        if options.mode.trim().is_empty() {
            options.mode = "http".into();
        }
        if options.timeout_secs == 0 {
            options.timeout_secs = 30;
        }
        if options.user_agent.trim().is_empty() {
            options.user_agent = WebFetchOptions::default().user_agent;
        }
        if options.wait_until.trim().is_empty() {
            options.wait_until = "domcontentloaded".into();
        }
        Self { options }
    }

    async fn http_fetch(&self, url: &str, max_length: usize) -> Result<String> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(self.options.timeout_secs))
            .user_agent(&self.options.user_agent)
            .build()?;

        let resp = match client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return Ok(format!("Error: fetch failed: {e}")),
        };

        if !resp.status().is_success() {
            return Ok(format!("Error: HTTP {}", resp.status()));
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = match resp.text().await {
            Ok(t) => t,
            Err(e) => return Ok(format!("Error: failed to read body: {e}")),
        };

        if content_type.contains("application/json") {
            return Ok(truncate_text(&body, max_length));
        }

        Ok(truncate_text(&extract_text_from_html(&body), max_length))
    }

    async fn browser_fetch(&self, url: &str, max_length: usize) -> Result<String> {
        let script_path = self.options.script_path.trim();
        if script_path.is_empty() {
            return Ok("Error: web_fetch browser mode requires tools.web.fetch.scriptPath".into());
        }
        let script_path = resolve_script_path(script_path);
        if !script_path.is_file() {
            return Ok(format!(
                "Error: web_fetch script not found: {}",
                script_path.display()
            ));
        }

        let node_path = if self.options.node_path.trim().is_empty() {
            "node"
        } else {
            self.options.node_path.trim()
        };

        let request = BrowserFetchRequest {
            url: url.to_string(),
            timeout_ms: self.options.timeout_secs * 1000,
            user_agent: self.options.user_agent.clone(),
            wait_until: self.options.wait_until.clone(),
        };
        let payload = serde_json::to_vec(&request)?;

        let mut child = tokio::process::Command::new(node_path)
            .arg(&script_path)
            .env("PLAYWRIGHT_BROWSERS_PATH", "0")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to start browser fetcher: {e}"))?;

        {
            use tokio::io::AsyncWriteExt;
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow::anyhow!("browser fetcher has no stdin"))?;
            stdin.write_all(&payload).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            let err = err.trim();
            return Ok(format!(
                "Error: browser fetch failed: {}",
                if err.is_empty() { "unknown" } else { err }
            ));
        }

        let result: BrowserFetchResult = match serde_json::from_slice(&output.stdout) {
            Ok(r) => r,
            Err(e) => return Ok(format!("Error: browser fetch parse error: {e}")),
        };
        if !result.ok {
            let err = if result.error.is_empty() {
                "unknown browser fetch error".to_string()
            } else {
                result.error
            };
            return Ok(format!("Error: browser fetch error: {err}"));
        }

        let mut text = result.text.trim().to_string();
        if !result.title.is_empty() {
            text = format!("{}\n\n{text}", result.title);
        }
        Ok(truncate_text(&text, max_length))
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch and extract text content from a web page. Use for reading documentation, \
         articles, or any web content."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "URL to fetch"
                },
                "max_length": {
                    "type": "integer",
                    "description": "Maximum content length to return (default: 10000)",
                    "minimum": 100,
                    "maximum": 50000
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: url"))?;

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Ok(format!("Error: only http/https URLs are supported: {url}"));
        }

        let max_length = params
            .get("max_length")
            .and_then(|v| v.as_u64())
            .map(|m| m as usize)
            .filter(|&m| (100..=50_000).contains(&m))
            .unwrap_or(10_000);

        if self.options.mode.eq_ignore_ascii_case("browser") {
            self.browser_fetch(url, max_length).await
        } else {
            self.http_fetch(url, max_length).await
        }
    }
}

fn resolve_script_path(path: &str) -> PathBuf {
    let expanded = nanobot_config::expand_path(path);
    std::path::absolute(&expanded).unwrap_or_else(|_| PathBuf::from(expanded))
}

fn truncate_text(text: &str, max_length: usize) -> String {
    if max_length == 0 || text.len() <= max_length {
        return text.to_string();
    }
    let mut end = max_length;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n... (content truncated)", &text[..end])
}

/// Tag-stripping HTML to text conversion.
fn extract_text_from_html(html: &str) -> String {
    let script_re = Regex::new(r"(?is)<script[\s\S]*?</script>").unwrap();
    let style_re = Regex::new(r"(?is)<style[\s\S]*?</style>").unwrap();
    let break_re =
        Regex::new(r"(?i)</(p|div|h[1-6]|li)>|<br\s*/?>").unwrap();
    let tag_re = Regex::new(r"<[^>]+>").unwrap();
    let spaces_re = Regex::new(r"[ \t]+").unwrap();
    let newlines_re = Regex::new(r"\n{3,}").unwrap();

    let text = script_re.replace_all(html, "");
    let text = style_re.replace_all(&text, "");
    let text = break_re.replace_all(&text, "\n");
    let text = tag_re.replace_all(&text, "");
    let text = html_escape::decode_html_entities(&text).into_owned();
    let text = spaces_re.replace_all(&text, " ");
    newlines_re.replace_all(&text, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_tags_stripped() {
        let html = "<html><head><style>p{color:red}</style><script>alert(1)</script></head>\
                    <body><h1>Title</h1><p>First &amp; second.</p><p>Third.</p></body></html>";
        let text = extract_text_from_html(html);
        assert!(text.contains("Title"));
        assert!(text.contains("First & second."));
        assert!(text.contains("Third."));
        assert!(!text.contains("alert"));
        assert!(!text.contains("color:red"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn truncation_appends_marker() {
        let long = "x".repeat(200);
        let out = truncate_text(&long, 100);
        assert!(out.starts_with(&"x".repeat(100)));
        assert!(out.ends_with("... (content truncated)"));
        assert_eq!(truncate_text("short", 100), "short");
    }

    #[tokio::test]
    async fn non_http_scheme_rejected() {
        let tool = WebFetchTool::new(WebFetchOptions::default());
        let result = tool
            .execute(serde_json::json!({"url": "file:///etc/passwd"}))
            .await
            .unwrap();
        assert!(result.contains("only http/https"));
    }

    #[tokio::test]
    async fn browser_mode_requires_script_path() {
        let tool = WebFetchTool::new(WebFetchOptions {
            mode: "browser".into(),
            ..Default::default()
        });
        let result = tool
            .execute(serde_json::json!({"url": "https://example.com"}))
            .await
            .unwrap();
        assert!(result.contains("scriptPath"));
    }

    #[tokio::test]
    async fn search_without_key_reports_configuration() {
        let tool = WebSearchTool::new(String::new(), 5);
        let result = tool
            .execute(serde_json::json!({"query": "rust"}))
            .await
            .unwrap();
        assert!(result.contains("API key not configured"));
    }

    #[test]
    fn fetch_options_normalized() {
        let tool = WebFetchTool::new(WebFetchOptions {
            mode: " ".into(),
            node_path: String::new(),
            script_path: String::new(),
            timeout_secs: 0,
            user_agent: String::new(),
            wait_until: String::new(),
        });
        assert_eq!(tool.options.mode, "http");
        assert_eq!(tool.options.timeout_secs, 30);
        assert!(!tool.options.user_agent.is_empty());
        assert_eq!(tool.options.wait_until, "domcontentloaded");
    }
}
