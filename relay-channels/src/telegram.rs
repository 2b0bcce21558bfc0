use crate::traits::ChannelAdapter;
use crate::types::{ChatScope, InboundMessage, InboundMessageKind, OutboundMessage};
use anyhow::Result;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
}

/// The bot account behind the token, resolved with `getMe`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BotProfile {
    id: i64,
    username: String,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("telegram bot token is empty"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
        })
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "https://api.telegram.org/bot{}/{}",
            self.bot_token, method
        ))?)
    }

    async fn get_me(&self) -> Result<BotProfile> {
        let url = self.api_url("getMe")?;
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "telegram getMe failed: status={status} body={text}"
            ));
        }
        let parsed: TelegramGetMeResponse = resp.json().await?;
        let username = parsed
            .result
            .username
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("telegram getMe returned no username"))?;
        Ok(BotProfile {
            id: parsed.result.id,
            username,
        })
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let me = self.get_me().await?;
        tracing::info!(bot_id = me.id, bot_username = %me.username, "telegram bot identity resolved");
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(me, tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let url = self.api_url("sendMessage")?;
        let reply_to = message
            .reply_to_message_id
            .as_ref()
            .and_then(|id| id.as_str().parse::<i64>().ok());
        for chunk in split_message(&message.content, TELEGRAM_MAX_MESSAGE_CHARS) {
            let mut body = serde_json::json!({
                "chat_id": recipient_id,
                "text": chunk,
            });
            if let Some(message_id) = reply_to {
                body["reply_parameters"] = serde_json::json!({
                    "message_id": message_id,
                    "allow_sending_without_reply": true,
                });
            }
            let resp = self.http.post(url.clone()).json(&body).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await?;
                return Err(anyhow::anyhow!(
                    "telegram send failed: status={status} body={text}"
                ));
            }
        }
        Ok(())
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, me: BotProfile, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response.json::<TelegramGetUpdatesResponse>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result;
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                let Some(inbound) =
                    build_message_inbound(update.update_id, update.message.as_ref(), &me)
                else {
                    continue;
                };
                tx.send(inbound)
                    .await
                    .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn build_message_inbound(
    update_id: i64,
    message: Option<&TelegramMessage>,
    me: &BotProfile,
) -> Option<InboundMessage> {
    let message = message?;
    let chat = message.chat.as_ref()?;
    let scope = if chat.r#type == "private" {
        ChatScope::Private
    } else {
        ChatScope::Group
    };

    let (kind, content) = if !message.new_chat_members.is_empty() {
        let names: Vec<String> = message
            .new_chat_members
            .iter()
            .map(TelegramUser::display_name)
            .collect();
        (InboundMessageKind::JoinGroup, names.join(", "))
    } else if let Some(text) = message.text.as_deref().or(message.caption.as_deref()) {
        (InboundMessageKind::Text, text.to_string())
    } else if message.has_non_text_payload() {
        (InboundMessageKind::Other, String::new())
    } else {
        return None;
    };

    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:message"));

    Some(InboundMessage {
        kind,
        message_id: message_id.into(),
        channel_id: TELEGRAM_CHANNEL_ID.into(),
        scope,
        chat_id: chat.id.to_string(),
        sender_id: message.from.as_ref().map(|user| user.id.to_string().into()),
        sender_name: message
            .from
            .as_ref()
            .map(TelegramUser::display_name)
            .unwrap_or_default(),
        group_id: match scope {
            ChatScope::Group => Some(chat.id.to_string().into()),
            ChatScope::Private => None,
        },
        mentions_bot: mentions_bot(message, &content, me),
        from_self: message.from.as_ref().is_some_and(|user| user.id == me.id),
        bot_name: me.username.clone(),
        content,
        metadata: serde_json::to_value(message).unwrap_or(serde_json::Value::Null),
        received_at: Utc::now(),
    })
}

fn mentions_bot(message: &TelegramMessage, content: &str, me: &BotProfile) -> bool {
    let handle = format!("@{}", me.username);
    let entities = if message.text.is_some() {
        &message.entities
    } else {
        &message.caption_entities
    };
    let by_entity = entities.iter().any(|entity| match entity.r#type.as_str() {
        "mention" => utf16_slice(content, entity.offset, entity.length)
            .is_some_and(|s| s.eq_ignore_ascii_case(&handle)),
        "text_mention" => entity.user.as_ref().is_some_and(|u| u.id == me.id),
        _ => false,
    });
    let by_reply = message
        .reply_to_message
        .as_ref()
        .and_then(|reply| reply.from.as_ref())
        .is_some_and(|user| user.id == me.id);
    by_entity || by_reply || content.contains(&handle)
}

/// Telegram entity offsets count UTF-16 code units.
fn utf16_slice(text: &str, offset: usize, length: usize) -> Option<String> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let end = offset.checked_add(length)?;
    let slice = units.get(offset..end)?;
    String::from_utf16(slice).ok()
}

fn split_message(content: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[derive(Debug, Deserialize)]
struct TelegramGetMeResponse {
    result: TelegramUser,
}

#[derive(Debug, Deserialize)]
struct TelegramGetUpdatesResponse {
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Default, Deserialize, serde::Serialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    entities: Vec<TelegramEntity>,
    #[serde(default)]
    caption_entities: Vec<TelegramEntity>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
    #[serde(default)]
    new_chat_members: Vec<TelegramUser>,
    #[serde(default)]
    photo: Vec<serde_json::Value>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
    #[serde(default)]
    animation: Option<serde_json::Value>,
    #[serde(default)]
    audio: Option<serde_json::Value>,
    #[serde(default)]
    document: Option<serde_json::Value>,
    #[serde(default)]
    video: Option<serde_json::Value>,
    #[serde(default)]
    voice: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramEntity {
    r#type: String,
    offset: usize,
    length: usize,
    #[serde(default)]
    user: Option<TelegramUser>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl TelegramUser {
    fn display_name(&self) -> String {
        let full = match self.last_name.as_deref().filter(|s| !s.is_empty()) {
            Some(last) => format!("{} {last}", self.first_name),
            None => self.first_name.clone(),
        };
        let full = full.trim().to_string();
        if !full.is_empty() {
            return full;
        }
        self.username.clone().unwrap_or_else(|| self.id.to_string())
    }
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}

impl TelegramMessage {
    fn has_non_text_payload(&self) -> bool {
        !self.photo.is_empty()
            || self.sticker.is_some()
            || self.animation.is_some()
            || self.audio.is_some()
            || self.document.is_some()
            || self.video.is_some()
            || self.voice.is_some()
    }
}
