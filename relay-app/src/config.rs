//! chatrelay configuration loader.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub llm: LlmConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    /// Endpoint override for OpenAI-compatible servers.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

fn default_llm_timeout_seconds() -> u64 {
    60
}

/// Settings read per decision by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Private messages answered per local day, across all senders.
    #[serde(default = "default_private_limit")]
    pub private_limit: u32,
    /// Group mentions answered per local day, across all groups.
    #[serde(default = "default_group_limit")]
    pub group_limit: u32,
    /// When set, private messages must contain it to be answered.
    #[serde(default)]
    pub private_trigger_keyword: String,
    #[serde(default = "default_welcome_to_group")]
    pub welcome_to_group: bool,
    /// Prepended to private replies.
    #[serde(default)]
    pub reply_prefix: String,
}

fn default_private_limit() -> u32 {
    50
}

fn default_group_limit() -> u32 {
    100
}

fn default_welcome_to_group() -> bool {
    true
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            private_limit: default_private_limit(),
            group_limit: default_group_limit(),
            private_trigger_keyword: String::new(),
            welcome_to_group: default_welcome_to_group(),
            reply_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on remembered senders; least recently used are evicted first.
    /// Unbounded when absent.
    #[serde(default)]
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_config_reload_interval_ms")]
    pub config_reload_interval_ms: u64,
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,
}

fn default_config_reload_interval_ms() -> u64 {
    2000
}

fn default_inbound_queue_capacity() -> usize {
    1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            config_reload_interval_ms: default_config_reload_interval_ms(),
            inbound_queue_capacity: default_inbound_queue_capacity(),
        }
    }
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = match path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let cfg = Self::from_toml(&contents)
            .map_err(|e| anyhow::anyhow!("config {}: {e}", path.display()))?;
        Ok((cfg, path))
    }

    /// Parses, applies environment overrides and validates.
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let mut cfg: RelayConfig =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse: {e}"))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = non_empty_env("CHATRELAY_MODEL") {
            self.llm.model = v;
        }
        if self.llm.api_key.trim().is_empty() {
            let var = if self.is_anthropic_model() {
                "ANTHROPIC_API_KEY"
            } else {
                "OPENAI_API_KEY"
            };
            if let Some(v) = non_empty_env(var) {
                self.llm.api_key = v;
            }
        }
        if let Some(v) = non_empty_env("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.bot_token = v;
            self.channels.telegram.enabled = true;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.model is required"));
        }
        if self.llm.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("llm.timeout_seconds must be > 0"));
        }
        if self.llm.max_tokens == 0 {
            return Err(anyhow::anyhow!("llm.max_tokens must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(anyhow::anyhow!(
                "llm.temperature must be within 0.0..=2.0, got {}",
                self.llm.temperature
            ));
        }
        if self.session.max_entries == Some(0) {
            return Err(anyhow::anyhow!("session.max_entries must be > 0 when set"));
        }
        if self.channels.telegram.enabled && self.channels.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "channels.telegram.bot_token is required when telegram is enabled"
            ));
        }
        if self.runtime.config_reload_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "runtime.config_reload_interval_ms must be > 0"
            ));
        }
        if self.runtime.inbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("runtime.inbound_queue_capacity must be > 0"));
        }
        Ok(())
    }

    pub fn is_anthropic_model(&self) -> bool {
        self.llm.model.to_ascii_lowercase().starts_with("claude-")
    }

    pub fn completion_settings(&self) -> relay_llm::CompletionSettings {
        relay_llm::CompletionSettings {
            api_key: self.llm.api_key.clone(),
            model: self.llm.model.clone(),
            base_url: self.llm.base_url.clone(),
            system_prompt: self.llm.system_prompt.clone(),
            temperature: Some(self.llm.temperature),
            max_tokens: Some(self.llm.max_tokens),
            timeout: std::time::Duration::from_secs(self.llm.timeout_seconds),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = non_empty_env("CHATRELAY_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(Path::new(&home).join(".chatrelay").join("config.toml"))
}
