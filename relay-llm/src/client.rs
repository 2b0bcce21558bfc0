use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatResponse};
use async_trait::async_trait;
use std::time::Duration;

/// Single-prompt completion seam used by the dispatcher.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

#[derive(Debug, Clone)]
pub struct CompletionSettings {
    pub api_key: String,
    pub model: String,
    /// Overrides the provider endpoint (OpenAI-compatible servers, proxies).
    pub base_url: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Sampling {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    base_url: Option<String>,
    system_prompt: Option<String>,
    sampling: Sampling,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(settings: CompletionSettings) -> Result<Self> {
        if settings.model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model must not be empty".to_string()));
        }
        if settings.api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput(format!(
                "api key is missing for model {}",
                settings.model
            )));
        }
        let provider = detect_provider(&settings.model);
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            provider,
            api_key: settings.api_key,
            model: settings.model,
            base_url: settings
                .base_url
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            system_prompt: settings
                .system_prompt
                .filter(|prompt| !prompt.trim().is_empty()),
            sampling: Sampling {
                temperature: settings.temperature,
                max_tokens: settings.max_tokens,
            },
            client,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        match self.provider {
            Provider::OpenAI => {
                let c = OpenAiClient::new(
                    self.client.clone(),
                    &self.api_key,
                    &self.model,
                    self.base_url.as_deref(),
                );
                c.chat(messages, self.sampling).await
            }
            Provider::Anthropic => {
                let c = AnthropicClient::new(
                    self.client.clone(),
                    &self.api_key,
                    &self.model,
                    self.base_url.as_deref(),
                );
                c.chat(messages, self.sampling).await
            }
        }
    }

    fn prompt_messages(&self, prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.system_prompt.as_deref() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        messages
    }
}

#[async_trait]
impl Completion for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let started = std::time::Instant::now();
        let response = self.chat(&self.prompt_messages(prompt)).await?;
        tracing::info!(
            latency_ms = started.elapsed().as_millis() as u64,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            finish_reason = %response.finish_reason,
            "completion finished"
        );
        Ok(response.message.content)
    }
}

fn detect_provider(model: &str) -> Provider {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude-") {
        return Provider::Anthropic;
    }
    Provider::OpenAI
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn settings(model: &str) -> CompletionSettings {
        CompletionSettings {
            api_key: "test-key".to_string(),
            model: model.to_string(),
            base_url: Some("http://localhost:8080/v1/".to_string()),
            system_prompt: Some("  ".to_string()),
            temperature: Some(0.7),
            max_tokens: Some(512),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn provider_is_detected_from_model_family() {
        assert_eq!(detect_provider("claude-3-5-haiku"), Provider::Anthropic);
        assert_eq!(detect_provider("Claude-3-opus"), Provider::Anthropic);
        assert_eq!(detect_provider("gpt-4o-mini"), Provider::OpenAI);
        assert_eq!(detect_provider("qwen2.5"), Provider::OpenAI);
    }

    #[test]
    fn new_rejects_missing_key_or_model() {
        let mut missing_key = settings("gpt-4o-mini");
        missing_key.api_key = " ".to_string();
        assert!(matches!(
            LlmClient::new(missing_key),
            Err(LlmError::InvalidInput(_))
        ));

        let missing_model = settings("");
        assert!(matches!(
            LlmClient::new(missing_model),
            Err(LlmError::InvalidInput(_))
        ));
    }

    #[test]
    fn blank_system_prompt_is_dropped_and_base_url_normalized() {
        let client = LlmClient::new(settings("gpt-4o-mini")).expect("client builds");
        assert_eq!(client.base_url.as_deref(), Some("http://localhost:8080/v1"));

        let messages = client.prompt_messages("hello？");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello？");
    }

    #[test]
    fn system_prompt_precedes_user_prompt() {
        let mut s = settings("claude-3-5-haiku");
        s.system_prompt = Some("be brief".to_string());
        let client = LlmClient::new(s).expect("client builds");
        assert_eq!(client.provider(), Provider::Anthropic);

        let messages = client.prompt_messages("why？");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "why？");
    }
}
