use anyhow::{Context, Result};
use clap::ValueEnum;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use relay_core::AgentLoopConfig;
use relay_tools::WebSearchConfig;

/// Prefix for environment overrides, e.g. `RELAY_AGENT__MAX_ITERATIONS=5`.
pub const ENV_PREFIX: &str = "RELAY_";

static ENV_VAR: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("valid env var pattern")
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Profile used when `--profile` is not given
    #[serde(default = "default_profile_name")]
    pub default_profile: String,

    #[serde(default)]
    pub providers: HashMap<String, ProviderConfigEntry>,

    #[serde(default)]
    pub prompts: HashMap<String, PromptEntry>,

    #[serde(default)]
    pub profiles: HashMap<String, ProfileEntry>,

    #[serde(default)]
    pub agent: AgentConfigEntry,

    #[serde(default)]
    pub tools: ToolsConfigEntry,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Which stream protocol a profile speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Chat completion delta chunks with native tool calls
    #[default]
    Chat,
    /// Typed responses events with native tool calls
    Responses,
    /// Plain text; tool calls are emulated with fenced blocks
    Text,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireFormat::Chat => write!(f, "chat"),
            WireFormat::Responses => write!(f, "responses"),
            WireFormat::Text => write!(f, "text"),
        }
    }
}

/// A named system prompt
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptEntry {
    pub prompt: String,
}

/// A profile bundles provider, prompt, model, and wire format together
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileEntry {
    /// Provider name to use (references [providers.X])
    #[serde(default)]
    pub provider: Option<String>,

    /// Prompt name to use (references [prompts.X]) or inline system prompt
    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub wire_format: WireFormat,

    /// Extra parameters to pass to the API
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfigEntry {
    /// Literal key or `$VAR` reference
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub default_model: Option<String>,

    /// Extra parameters to pass to the API (e.g., reasoning_effort)
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

/// Agent loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigEntry {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub summarize_tool_results: bool,

    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// Model for history and tool-output summaries (defaults to the chat model)
    #[serde(default)]
    pub summary_model: Option<String>,
}

fn default_max_iterations() -> u32 {
    relay_core::agent_loop::DEFAULT_MAX_ITERATIONS
}

fn default_tool_timeout_secs() -> u64 {
    relay_core::agent_loop::DEFAULT_TOOL_TIMEOUT.as_secs()
}

fn default_max_context_tokens() -> usize {
    relay_core::agent_loop::DEFAULT_MAX_CONTEXT_TOKENS
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfigEntry {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_timeout_secs: default_tool_timeout_secs(),
            summarize_tool_results: true,
            max_context_tokens: default_max_context_tokens(),
            summary_model: None,
        }
    }
}

impl AgentConfigEntry {
    pub fn to_loop_config(&self) -> AgentLoopConfig {
        AgentLoopConfig::new()
            .with_max_iterations(self.max_iterations)
            .with_tool_timeout(Duration::from_secs(self.tool_timeout_secs))
            .with_summarization(self.summarize_tool_results)
            .with_max_context_tokens(self.max_context_tokens)
    }
}

/// Tools configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfigEntry {
    #[serde(default = "default_true")]
    pub enable_web: bool,

    /// Perplexica host for web_search; the tool is off when unset
    #[serde(default)]
    pub search_host: Option<String>,

    #[serde(default = "default_search_chat_model")]
    pub search_chat_model: String,

    #[serde(default = "default_search_embed_model")]
    pub search_embed_model: String,
}

fn default_search_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_search_embed_model() -> String {
    "text-embedding-3-large".to_string()
}

impl Default for ToolsConfigEntry {
    fn default() -> Self {
        Self {
            enable_web: true,
            search_host: None,
            search_chat_model: default_search_chat_model(),
            search_embed_model: default_search_embed_model(),
        }
    }
}

impl ToolsConfigEntry {
    pub fn web_search_config(&self) -> Option<WebSearchConfig> {
        let host = self.search_host.as_deref().filter(|h| !h.is_empty())?;
        Some(WebSearchConfig::new(
            expand_env(host),
            &self.search_chat_model,
            &self.search_embed_model,
        ))
    }
}

/// Expand `$VAR` and `${VAR}` from the environment. Unknown variables are
/// left as written.
pub fn expand_env(value: &str) -> String {
    ENV_VAR
        .replace_all(value, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() && !std::env::vars().any(|(k, _)| k.starts_with(ENV_PREFIX)) {
            anyhow::bail!(
                "No configuration found. Create {} with at least:\n\n\
                 default_profile = \"default\"\n\n\
                 [providers.openai]\n\
                 api_key = \"$OPENAI_API_KEY\"\n\n\
                 [profiles.default]\n\
                 provider = \"openai\"\n",
                config_path.display()
            )
        }

        Self::figment(Some(&config_path))
            .extract()
            .with_context(|| format!("Invalid configuration in {}", config_path.display()))
    }

    /// Config file layered under `RELAY_`-prefixed environment variables.
    /// Nested keys use `__`, e.g. `RELAY_TOOLS__SEARCH_HOST`.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("relay").join("config.toml"))
    }

    /// Resolve a profile name to its effective settings
    pub fn resolve_profile(&self, profile_name: &str) -> Option<ResolvedProfile> {
        let profile = self.profiles.get(profile_name)?;

        // Provider is required in profile
        let provider_name = profile.provider.clone()?;
        let provider_config = self.providers.get(&provider_name);

        // A prompt is either a named [prompts.X] entry or inline text
        let system_prompt = profile.prompt.as_ref().map(|p| {
            self.prompts
                .get(p)
                .map(|entry| entry.prompt.clone())
                .unwrap_or_else(|| p.clone())
        });

        // Merge parameters: provider params + profile params (profile wins)
        let mut parameters = provider_config
            .map(|p| p.parameters.clone())
            .unwrap_or_default();
        parameters.extend(profile.parameters.clone());

        Some(ResolvedProfile {
            provider_name,
            provider_config: provider_config.cloned(),
            system_prompt,
            model: profile.model.clone(),
            wire_format: profile.wire_format,
            parameters,
        })
    }
}

/// Resolved profile with all settings expanded
#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    pub provider_name: String,
    pub provider_config: Option<ProviderConfigEntry>,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub wire_format: WireFormat,
    pub parameters: HashMap<String, serde_json::Value>,
}
