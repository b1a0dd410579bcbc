use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub channels: ChannelsConfig,
    pub providers: ProvidersConfig,
    pub gateway: GatewayConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    pub workspace: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub max_tool_iterations: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.nanobot/workspace".into(),
            model: "anthropic/claude-opus-4-5".into(),
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelsConfig {
    pub telegram: TelegramConfig,
    pub discord: DiscordConfig,
    pub whatsapp: WhatsAppConfig,
    pub websocket: WebSocketConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub token: String,
    pub allow_from: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscordConfig {
    pub enabled: bool,
    pub token: String,
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WhatsAppConfig {
    pub enabled: bool,
    pub bridge_url: String,
    pub allow_from: Vec<String>,
    pub allow_self: bool,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bridge_url: "ws://localhost:3001".into(),
            allow_from: Vec::new(),
            allow_self: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub allow_origins: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".into(),
            port: 18791,
            path: "/ws".into(),
            allow_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub openrouter: ProviderConfig,
    pub anthropic: ProviderConfig,
    pub openai: ProviderConfig,
    pub deepseek: ProviderConfig,
    pub groq: ProviderConfig,
    pub gemini: ProviderConfig,
    pub moonshot: ProviderConfig,
    pub vllm: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 18890,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub web: WebToolsConfig,
    pub exec: ExecToolConfig,
    pub restrict_to_workspace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WebToolsConfig {
    pub search: WebSearchConfig,
    pub fetch: WebFetchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSearchConfig {
    pub api_key: String,
    pub max_results: u32,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebFetchConfig {
    pub mode: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub script_path: String,
    pub timeout: u64,
    pub user_agent: String,
    pub wait_until: String,
}

impl Default for WebFetchConfig {
    fn default() -> Self {
        Self {
            mode: "http".into(),
            node_path: String::new(),
            script_path: String::new(),
            timeout: 30,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .into(),
            wait_until: "domcontentloaded".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecToolConfig {
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

impl Config {
    /// Resolve the API key for a model identifier.
    ///
    /// Keyword matches run in a fixed priority order; an unmatched model
    /// falls back to the first provider with a non-empty key.
    pub fn api_key_for(&self, model: &str) -> String {
        let model = self.effective_model(model);

        let keyed: [(&str, &ProviderConfig); 11] = [
            ("openrouter", &self.providers.openrouter),
            ("deepseek", &self.providers.deepseek),
            ("anthropic", &self.providers.anthropic),
            ("claude", &self.providers.anthropic),
            ("openai", &self.providers.openai),
            ("gpt", &self.providers.openai),
            ("gemini", &self.providers.gemini),
            ("groq", &self.providers.groq),
            ("moonshot", &self.providers.moonshot),
            ("kimi", &self.providers.moonshot),
            ("vllm", &self.providers.vllm),
        ];

        for (keyword, provider) in keyed {
            if model.contains(keyword) && !provider.api_key.is_empty() {
                return provider.api_key.clone();
            }
        }

        // Fallback order is part of the external contract; do not reorder.
        let fallback = [
            &self.providers.openrouter,
            &self.providers.deepseek,
            &self.providers.anthropic,
            &self.providers.openai,
            &self.providers.gemini,
            &self.providers.moonshot,
            &self.providers.vllm,
            &self.providers.groq,
        ];
        for provider in fallback {
            if !provider.api_key.is_empty() {
                return provider.api_key.clone();
            }
        }

        String::new()
    }

    /// Resolve the API base URL for a model identifier.
    pub fn api_base_for(&self, model: &str) -> String {
        let model = self.effective_model(model);

        if model.contains("openrouter") {
            if !self.providers.openrouter.api_base.is_empty() {
                return self.providers.openrouter.api_base.clone();
            }
            return "https://openrouter.ai/api/v1".into();
        }
        if model.contains("vllm") {
            return self.providers.vllm.api_base.clone();
        }
        if model.contains("moonshot") || model.contains("kimi") {
            if !self.providers.moonshot.api_base.is_empty() {
                return self.providers.moonshot.api_base.clone();
            }
            return "https://api.moonshot.cn/v1".into();
        }
        if model.contains("deepseek") {
            if !self.providers.deepseek.api_base.is_empty() {
                return self.providers.deepseek.api_base.clone();
            }
            return "https://api.deepseek.com/v1".into();
        }

        String::new()
    }

    fn effective_model(&self, model: &str) -> String {
        let m = if model.is_empty() {
            &self.agents.defaults.model
        } else {
            model
        };
        m.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: Config = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg.agents.defaults.max_tool_iterations, 20);
        assert_eq!(cfg.gateway.port, 18890);
        assert_eq!(cfg.channels.websocket.path, "/ws");
        assert_eq!(cfg.tools.exec.timeout, 60);
        assert!(!cfg.tools.restrict_to_workspace);
    }

    #[test]
    fn camel_case_fields_parse() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "agents": {"defaults": {"maxToolIterations": 5, "workspace": "/tmp/ws"}},
            "channels": {"whatsapp": {"enabled": true, "bridgeUrl": "ws://x:1", "allowSelf": true}},
            "tools": {"restrictToWorkspace": true}
        }))
        .unwrap();
        assert_eq!(cfg.agents.defaults.max_tool_iterations, 5);
        assert_eq!(cfg.channels.whatsapp.bridge_url, "ws://x:1");
        assert!(cfg.channels.whatsapp.allow_self);
        assert!(cfg.tools.restrict_to_workspace);
    }

    #[test]
    fn api_key_keyword_routing() {
        let mut cfg = Config::default();
        cfg.providers.anthropic.api_key = "ant-key".into();
        cfg.providers.openai.api_key = "oai-key".into();

        assert_eq!(cfg.api_key_for("claude-sonnet"), "ant-key");
        assert_eq!(cfg.api_key_for("gpt-4o"), "oai-key");
        assert_eq!(cfg.api_key_for("GPT-4"), "oai-key");
    }

    #[test]
    fn api_key_fallback_order() {
        let mut cfg = Config::default();
        cfg.providers.groq.api_key = "groq-key".into();
        cfg.providers.gemini.api_key = "gem-key".into();

        // Unmatched model: gemini precedes groq in the fallback order.
        assert_eq!(cfg.api_key_for("some-local-model"), "gem-key");
    }

    #[test]
    fn api_key_empty_when_nothing_configured() {
        let cfg = Config::default();
        assert_eq!(cfg.api_key_for("gpt-4"), "");
    }

    #[test]
    fn api_base_well_known_defaults() {
        let cfg = Config::default();
        assert_eq!(
            cfg.api_base_for("openrouter/foo"),
            "https://openrouter.ai/api/v1"
        );
        assert_eq!(cfg.api_base_for("kimi-k2"), "https://api.moonshot.cn/v1");
        assert_eq!(
            cfg.api_base_for("deepseek-chat"),
            "https://api.deepseek.com/v1"
        );
        assert_eq!(cfg.api_base_for("gpt-4"), "");
    }

    #[test]
    fn api_base_prefers_configured_value() {
        let mut cfg = Config::default();
        cfg.providers.openrouter.api_base = "http://proxy.local/v1".into();
        assert_eq!(cfg.api_base_for("openrouter/foo"), "http://proxy.local/v1");
    }

    #[test]
    fn default_model_used_when_empty() {
        let mut cfg = Config::default();
        cfg.agents.defaults.model = "deepseek-chat".into();
        cfg.providers.deepseek.api_key = "ds".into();
        assert_eq!(cfg.api_key_for(""), "ds");
    }
}
