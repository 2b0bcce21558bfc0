use crate::client::Sampling;
use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatResponse, Role, Usage};
use serde::{Deserialize, Serialize};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 2048;

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            url: format!("{}/messages", base_url.unwrap_or(ANTHROPIC_BASE_URL)),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat(&self, messages: &[ChatMessage], sampling: Sampling) -> Result<ChatResponse> {
        let req = AnthropicRequest::new(&self.model, messages, sampling)?;

        let response = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "anthropic chat status={status} body={body}"
            )));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)?;
        parsed.try_into()
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

impl AnthropicRequest {
    fn new(model: &str, messages: &[ChatMessage], sampling: Sampling) -> Result<Self> {
        let mut system = String::new();
        let mut out_messages = Vec::new();

        for m in messages {
            match m.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(m.content.trim());
                }
                Role::User | Role::Assistant => out_messages.push(AnthropicMessage {
                    role: m.role.as_str().to_string(),
                    content: vec![AnthropicContentBlock::Text {
                        text: m.content.clone(),
                    }],
                }),
            }
        }

        if out_messages.is_empty() {
            return Err(LlmError::InvalidInput(
                "anthropic request needs at least one user message".to_string(),
            ));
        }

        Ok(Self {
            model: model.to_string(),
            max_tokens: sampling.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
            system,
            messages: out_messages,
            // Anthropic caps temperature at 1.0.
            temperature: sampling.temperature.map(|t| t.min(1.0)),
        })
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl TryFrom<AnthropicResponse> for ChatResponse {
    type Error = LlmError;

    fn try_from(v: AnthropicResponse) -> Result<Self> {
        if v.content.is_empty() {
            return Err(LlmError::ResponseFormat(
                "anthropic response missing content blocks".to_string(),
            ));
        }

        let mut content = String::new();
        for block in v.content {
            if let AnthropicContentBlock::Text { text } = block {
                content.push_str(&text);
            }
        }

        Ok(ChatResponse {
            message: ChatMessage::assistant(content),
            usage: Usage {
                prompt_tokens: v.usage.input_tokens as u32,
                completion_tokens: v.usage.output_tokens as u32,
            },
            finish_reason: v.stop_reason.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_lifted_out_of_the_conversation() {
        let messages = vec![
            ChatMessage::system(" be brief "),
            ChatMessage::user("what is 2+2？"),
        ];
        let req = AnthropicRequest::new(
            "claude-3-5-haiku",
            &messages,
            Sampling {
                temperature: Some(1.6),
                max_tokens: None,
            },
        )
        .expect("build request");
        assert_eq!(req.system, "be brief");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.max_tokens, ANTHROPIC_DEFAULT_MAX_TOKENS);
        assert_eq!(req.temperature, Some(1.0));
    }

    #[test]
    fn request_without_user_message_is_rejected() {
        let err = AnthropicRequest::new(
            "claude-3-5-haiku",
            &[ChatMessage::system("only system")],
            Sampling::default(),
        )
        .expect_err("no user message");
        assert!(matches!(err, LlmError::InvalidInput(_)));
    }

    #[test]
    fn response_concatenates_text_blocks_and_skips_others() {
        let parsed: AnthropicResponse = serde_json::from_str(
            r#"{
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "2+2 "},
                    {"type": "text", "text": "is 4."}
                ],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 5}
            }"#,
        )
        .expect("parse response");
        let resp = ChatResponse::try_from(parsed).expect("convert response");
        assert_eq!(resp.message.content, "2+2 is 4.");
        assert_eq!(resp.usage.completion_tokens, 5);
        assert_eq!(resp.finish_reason, "end_turn");
    }
}
