//! Inbound message dispatcher: all channel adapters feed into a single queue,
//! and each message runs through quota, pipeline, completion and session on
//! its own task.

use crate::config::RelayConfig;
use crate::config_control::ConfigControl;
use crate::pipeline::{self, ReplyDecoration};
use crate::quota::QuotaTracker;
use crate::session::{SenderIdentity, SessionStore};
use anyhow::{Context, Result};
use relay_channels::{
    ChannelAdapter, ChatScope, InboundMessage, InboundMessageKind, OutboundMessage,
};
use relay_llm::Completion;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const HELP_TEXT: &str = "I'm a chat relay bot. Message me privately, or mention me in a group, \
and I'll forward your question to a language model and reply with its answer. \
I remember only our last exchange, and daily message quotas apply.";

pub const QUOTA_EXCEEDED_NOTICE: &str =
    "The daily message quota has been used up. Please try again tomorrow.";

/// How a single inbound message ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Welcomed,
    Help,
    /// Nothing to answer; no reply was sent.
    Ignored(&'static str),
    /// Sender or group could not be identified; dropped without a reply.
    UnresolvedSender,
    QuotaExceeded,
    /// Nothing left after normalization; dropped without a reply.
    EmptyRequest,
    /// The completion service failed; the sender was told why.
    CompletionFailed,
    Replied,
}

pub struct Dispatcher {
    config: Arc<ConfigControl>,
    quota: Arc<QuotaTracker>,
    sessions: Arc<SessionStore>,
    completion: Arc<dyn Completion>,
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<ConfigControl>,
        quota: Arc<QuotaTracker>,
        sessions: Arc<SessionStore>,
        completion: Arc<dyn Completion>,
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    ) -> Self {
        Self {
            config,
            quota,
            sessions,
            completion,
            channels,
        }
    }

    /// Drains the inbound queue until it closes or `shutdown` fires.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("dispatcher stopping");
                    return;
                }
                msg = inbound_rx.recv() => msg,
            };
            let Some(inbound) = inbound else {
                tracing::info!("inbound queue closed");
                return;
            };

            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(inbound).await;
            });
        }
    }

    /// Handles one message and logs how it ended.
    pub async fn dispatch(&self, inbound: InboundMessage) {
        let started = Instant::now();
        let channel_id = inbound.channel_id.clone();
        let message_id = inbound.message_id.clone();
        match self.handle(inbound).await {
            Ok(outcome @ (DispatchOutcome::QuotaExceeded | DispatchOutcome::CompletionFailed)) => {
                tracing::warn!(
                    channel = %channel_id,
                    message_id = %message_id,
                    ?outcome,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "message handled"
                );
            }
            Ok(outcome) => {
                tracing::info!(
                    channel = %channel_id,
                    message_id = %message_id,
                    ?outcome,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "message handled"
                );
            }
            Err(e) => {
                tracing::warn!(
                    channel = %channel_id,
                    message_id = %message_id,
                    error = %format!("{e:#}"),
                    "message handling failed"
                );
            }
        }
    }

    /// Runs the per-message state machine. Only reply delivery failures are errors.
    pub async fn handle(&self, inbound: InboundMessage) -> Result<DispatchOutcome> {
        let config = self.config.current().await;
        tracing::debug!(
            channel = %inbound.channel_id,
            scope = %inbound.scope,
            kind = ?inbound.kind,
            sender = inbound.sender_id.as_deref().unwrap_or("-"),
            content_len = inbound.content.chars().count(),
            "inbound message"
        );

        match inbound.kind {
            InboundMessageKind::JoinGroup => return self.welcome(&config, &inbound).await,
            InboundMessageKind::Other => return Ok(DispatchOutcome::Ignored("non-text message")),
            InboundMessageKind::Text => {}
        }

        let Some(identity) = resolve_identity(&inbound) else {
            tracing::warn!(
                channel = %inbound.channel_id,
                scope = %inbound.scope,
                chat = %inbound.chat_id,
                "cannot resolve sender identity"
            );
            return Ok(DispatchOutcome::UnresolvedSender);
        };
        if inbound.from_self {
            return Ok(DispatchOutcome::Ignored("own message"));
        }

        let text = match inbound.scope {
            ChatScope::Private => {
                let keyword = config.chat.private_trigger_keyword.as_str();
                if !keyword.is_empty() {
                    if inbound.content == keyword {
                        self.reply(&inbound, HELP_TEXT).await?;
                        return Ok(DispatchOutcome::Help);
                    }
                    if !inbound.content.contains(keyword) {
                        return Ok(DispatchOutcome::Ignored("trigger keyword missing"));
                    }
                }
                pipeline::strip_trigger_keyword(&inbound.content, keyword)
            }
            ChatScope::Group => {
                if !inbound.mentions_bot {
                    return Ok(DispatchOutcome::Ignored("bot not mentioned"));
                }
                inbound.content.clone()
            }
        };

        let limit = match inbound.scope {
            ChatScope::Private => config.chat.private_limit,
            ChatScope::Group => config.chat.group_limit,
        };
        let admission = self.quota.admit(inbound.scope, limit);
        if !admission.admitted {
            tracing::warn!(
                scope = %inbound.scope,
                count = admission.count,
                limit = admission.limit,
                "daily quota exceeded"
            );
            self.reply(&inbound, QUOTA_EXCEEDED_NOTICE).await?;
            return Ok(DispatchOutcome::QuotaExceeded);
        }

        let self_mention = match inbound.scope {
            ChatScope::Group => Some(inbound.bot_name.as_str()),
            ChatScope::Private => None,
        };
        // The session keeps the sender's own words, not the prompt with context.
        let Some(question) = pipeline::normalize_question(&text, self_mention) else {
            return Ok(DispatchOutcome::EmptyRequest);
        };
        let prior_context = self.sessions.context(&identity);
        let Some(request) = pipeline::build_request(&question, &prior_context, None) else {
            return Ok(DispatchOutcome::EmptyRequest);
        };

        let raw_reply = match self.completion.complete(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "completion failed");
                self.reply(&inbound, &format!("completion request error: {e}"))
                    .await?;
                return Ok(DispatchOutcome::CompletionFailed);
            }
        };

        self.sessions.set_capacity(config.session.max_entries);
        self.sessions.put(identity, &question, &raw_reply);

        let decoration = match inbound.scope {
            ChatScope::Private => ReplyDecoration::Private {
                prefix: &config.chat.reply_prefix,
            },
            ChatScope::Group => ReplyDecoration::Group {
                sender_name: &inbound.sender_name,
                question: &question,
            },
        };
        let reply = pipeline::build_reply(&raw_reply, decoration);
        self.reply(&inbound, &reply).await?;
        Ok(DispatchOutcome::Replied)
    }

    async fn welcome(
        &self,
        config: &RelayConfig,
        inbound: &InboundMessage,
    ) -> Result<DispatchOutcome> {
        if inbound.scope != ChatScope::Group {
            return Ok(DispatchOutcome::Ignored("join event outside a group"));
        }
        if !config.chat.welcome_to_group {
            return Ok(DispatchOutcome::Ignored("group welcome disabled"));
        }
        let joined = inbound.content.trim();
        if joined.is_empty() {
            return Ok(DispatchOutcome::Ignored("join event without names"));
        }
        self.reply(inbound, &pipeline::welcome_text(joined)).await?;
        Ok(DispatchOutcome::Welcomed)
    }

    async fn reply(&self, inbound: &InboundMessage, content: &str) -> Result<()> {
        let channel = self
            .channels
            .get(inbound.channel_id.as_str())
            .with_context(|| format!("unknown channel: {}", inbound.channel_id))?;
        channel
            .send(
                &inbound.chat_id,
                OutboundMessage::reply(content, &inbound.message_id),
            )
            .await
            .with_context(|| format!("send reply to {}", inbound.chat_id))
    }
}

fn resolve_identity(inbound: &InboundMessage) -> Option<SenderIdentity> {
    let sender = inbound.sender_id.clone().filter(|id| !id.is_empty())?;
    match inbound.scope {
        ChatScope::Private => Some(SenderIdentity::Private {
            channel_id: inbound.channel_id.clone(),
            user_id: sender,
        }),
        ChatScope::Group => {
            let group_id = inbound.group_id.clone().filter(|id| !id.is_empty())?;
            Some(SenderIdentity::Group {
                channel_id: inbound.channel_id.clone(),
                group_id,
                member_id: sender,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use async_trait::async_trait;
    use relay_channels::{ChannelId, GroupId, MessageId, SenderId};
    use relay_llm::LlmError;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(String, OutboundMessage)>>,
    }

    impl RecordingChannel {
        fn sent(&self) -> Vec<(String, OutboundMessage)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingChannel {
        fn channel_id(&self) -> &str {
            "telegram"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
            Ok(())
        }

        async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((recipient_id.to_string(), message));
            Ok(())
        }
    }

    struct ScriptedCompletion {
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
        reply: std::result::Result<String, String>,
    }

    impl ScriptedCompletion {
        fn replying(reply: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                reply: Ok(reply.to_string()),
            }
        }

        fn failing(detail: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                reply: Err(detail.to_string()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Completion for ScriptedCompletion {
        async fn complete(&self, prompt: &str) -> relay_llm::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone().map_err(LlmError::Http)
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        channel: Arc<RecordingChannel>,
        completion: Arc<ScriptedCompletion>,
        sessions: Arc<SessionStore>,
        quota: Arc<QuotaTracker>,
        config: Arc<ConfigControl>,
    }

    fn test_config(chat: ChatConfig) -> RelayConfig {
        let mut cfg = RelayConfig::from_toml(
            r#"
[llm]
model = "gpt-4o-mini"
api_key = "test-key"
"#,
        )
        .unwrap();
        cfg.chat = chat;
        cfg
    }

    fn harness_at(path: PathBuf, chat: ChatConfig, completion: ScriptedCompletion) -> Harness {
        let config = Arc::new(ConfigControl::new(path, test_config(chat)).unwrap());
        let channel = Arc::new(RecordingChannel::default());
        let completion = Arc::new(completion);
        let sessions = Arc::new(SessionStore::new());
        let quota = Arc::new(QuotaTracker::new());
        let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
        channels.insert("telegram".to_string(), channel.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            quota.clone(),
            sessions.clone(),
            completion.clone(),
            channels,
        ));
        Harness {
            dispatcher,
            channel,
            completion,
            sessions,
            quota,
            config,
        }
    }

    fn harness(chat: ChatConfig, completion: ScriptedCompletion) -> Harness {
        harness_at(PathBuf::from("unused.toml"), chat, completion)
    }

    fn message(scope: ChatScope, content: &str) -> InboundMessage {
        InboundMessage {
            kind: InboundMessageKind::Text,
            message_id: MessageId::new("m1"),
            channel_id: ChannelId::new("telegram"),
            scope,
            chat_id: match scope {
                ChatScope::Private => "42".to_string(),
                ChatScope::Group => "-100".to_string(),
            },
            sender_id: Some(SenderId::new("42")),
            sender_name: "Ann".to_string(),
            group_id: match scope {
                ChatScope::Private => None,
                ChatScope::Group => Some(GroupId::new("-100")),
            },
            content: content.to_string(),
            mentions_bot: false,
            from_self: false,
            bot_name: "Bot".to_string(),
            metadata: serde_json::Value::Null,
            received_at: chrono::Utc::now(),
        }
    }

    fn private(content: &str) -> InboundMessage {
        message(ChatScope::Private, content)
    }

    fn group_mention(content: &str) -> InboundMessage {
        let mut msg = message(ChatScope::Group, content);
        msg.mentions_bot = true;
        msg
    }

    #[tokio::test]
    async fn third_private_message_over_limit_gets_quota_notice() {
        let h = harness(
            ChatConfig {
                private_limit: 2,
                ..ChatConfig::default()
            },
            ScriptedCompletion::replying("ok"),
        );

        for _ in 0..2 {
            let outcome = h.dispatcher.handle(private("hi")).await.unwrap();
            assert_eq!(outcome, DispatchOutcome::Replied);
        }
        let outcome = h.dispatcher.handle(private("hi")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::QuotaExceeded);

        assert_eq!(h.completion.calls(), 2);
        let sent = h.channel.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].1.content, QUOTA_EXCEEDED_NOTICE);
        assert_eq!(sent[2].1.reply_to_message_id, Some(MessageId::new("m1")));
        assert_eq!(h.quota.count(ChatScope::Private), 3);
    }

    #[tokio::test]
    async fn rejected_message_leaves_session_untouched() {
        let h = harness(
            ChatConfig {
                private_limit: 1,
                ..ChatConfig::default()
            },
            ScriptedCompletion::replying("first answer"),
        );
        h.dispatcher.handle(private("first")).await.unwrap();
        h.dispatcher.handle(private("second")).await.unwrap();

        let identity = SenderIdentity::Private {
            channel_id: ChannelId::new("telegram"),
            user_id: SenderId::new("42"),
        };
        let ctx = h.sessions.get(&identity).unwrap();
        assert_eq!(ctx.last_request, "first");
        assert_eq!(ctx.last_reply, "first answer");
    }

    #[tokio::test]
    async fn second_private_message_carries_previous_exchange() {
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying("hello there"));
        h.dispatcher.handle(private("hi")).await.unwrap();
        h.dispatcher.handle(private("again")).await.unwrap();

        let prompts = h.completion.prompts.lock().unwrap().clone();
        assert_eq!(prompts, vec!["hi？".to_string(), "hi\nhello there\nagain？".to_string()]);
    }

    #[tokio::test]
    async fn group_reply_mentions_sender_and_echoes_question() {
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying("4"));
        let outcome = h
            .dispatcher
            .handle(group_mention("hello @Bot what is 2+2"))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Replied);

        let prompts = h.completion.prompts.lock().unwrap().clone();
        assert_eq!(prompts, vec!["hello  what is 2+2？".to_string()]);

        let sent = h.channel.sent();
        assert_eq!(sent[0].0, "-100");
        assert_eq!(
            sent[0].1.content,
            "@Ann\nhello  what is 2+2\n --------------------------------\n4"
        );
        assert_eq!(h.quota.count(ChatScope::Group), 1);
        assert_eq!(h.quota.count(ChatScope::Private), 0);
    }

    #[tokio::test]
    async fn context_holds_only_the_latest_exchange() {
        let long_reply = "r".repeat(1500);
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying(&long_reply));
        for turn in 0..5 {
            let outcome = h
                .dispatcher
                .handle(private(&format!("question {turn}")))
                .await
                .unwrap();
            assert_eq!(outcome, DispatchOutcome::Replied);
        }

        let prompts = h.completion.prompts.lock().unwrap().clone();
        assert_eq!(prompts[1], format!("question 0\n{long_reply}\nquestion 1？"));
        assert!(!prompts[2].contains("question 0"));
        for (turn, prompt) in prompts.iter().enumerate().skip(1) {
            assert!(prompt.ends_with(&format!("question {turn}？")));
            assert!(prompt.starts_with(&format!("question {}\n", turn - 1)));
        }

        let identity = SenderIdentity::Private {
            channel_id: ChannelId::new("telegram"),
            user_id: SenderId::new("42"),
        };
        assert_eq!(h.sessions.get(&identity).unwrap().last_request, "question 4");
    }

    #[tokio::test]
    async fn mention_case_does_not_leak_into_prompt_or_echo() {
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying("4"));
        let outcome = h
            .dispatcher
            .handle(group_mention("@bot what is 2+2"))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Replied);

        let prompts = h.completion.prompts.lock().unwrap().clone();
        assert_eq!(prompts, vec!["what is 2+2？".to_string()]);
        assert_eq!(
            h.channel.sent()[0].1.content,
            "@Ann\nwhat is 2+2\n --------------------------------\n4"
        );
    }

    #[tokio::test]
    async fn unknown_bot_name_leaves_at_signs_in_echo() {
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying("ok"));
        let mut msg = group_mention("ping @ noon");
        msg.bot_name = String::new();
        h.dispatcher.handle(msg).await.unwrap();
        assert_eq!(
            h.channel.sent()[0].1.content,
            "@Ann\nping @ noon\n --------------------------------\nok"
        );
    }

    #[tokio::test]
    async fn group_members_have_separate_sessions() {
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying("sure"));
        h.dispatcher.handle(group_mention("@Bot one")).await.unwrap();
        let mut other = group_mention("@Bot two");
        other.sender_id = Some(SenderId::new("7"));
        h.dispatcher.handle(other).await.unwrap();

        let prompts = h.completion.prompts.lock().unwrap().clone();
        assert_eq!(prompts[1], "two？");
        assert_eq!(h.sessions.len(), 2);
    }

    #[tokio::test]
    async fn unmentioned_group_message_is_ignored_without_quota() {
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying("x"));
        let outcome = h
            .dispatcher
            .handle(message(ChatScope::Group, "just chatting"))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Ignored(_)));
        assert_eq!(h.quota.count(ChatScope::Group), 0);
        assert!(h.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn trigger_keyword_gates_private_messages() {
        let h = harness(
            ChatConfig {
                private_trigger_keyword: "bot".to_string(),
                reply_prefix: "[relay]".to_string(),
                ..ChatConfig::default()
            },
            ScriptedCompletion::replying("fine"),
        );

        let outcome = h.dispatcher.handle(private("bot")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Help);
        assert_eq!(h.channel.sent()[0].1.content, HELP_TEXT);

        let outcome = h.dispatcher.handle(private("hello there")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Ignored(_)));

        let outcome = h.dispatcher.handle(private("bot how are you")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Replied);
        let prompts = h.completion.prompts.lock().unwrap().clone();
        assert_eq!(prompts, vec!["how are you？".to_string()]);
        assert_eq!(h.channel.sent()[1].1.content, "[relay]\nfine");

        // Help and ignored messages do not consume quota.
        assert_eq!(h.quota.count(ChatScope::Private), 1);
    }

    #[tokio::test]
    async fn completion_failure_is_reported_to_sender() {
        let h = harness(
            ChatConfig::default(),
            ScriptedCompletion::failing("status 503: upstream down"),
        );
        let outcome = h.dispatcher.handle(private("hi")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::CompletionFailed);

        let sent = h.channel.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.content.starts_with("completion request error: "));
        assert!(sent[0].1.content.contains("status 503: upstream down"));
        assert!(h.sessions.is_empty());
    }

    #[tokio::test]
    async fn empty_request_is_dropped_silently() {
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying("x"));
        let outcome = h.dispatcher.handle(group_mention("@Bot")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::EmptyRequest);
        assert_eq!(h.completion.calls(), 0);
        assert!(h.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn unresolved_sender_is_dropped() {
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying("x"));
        let mut msg = group_mention("@Bot hi");
        msg.group_id = None;
        assert_eq!(
            h.dispatcher.handle(msg).await.unwrap(),
            DispatchOutcome::UnresolvedSender
        );
        let mut msg = private("hi");
        msg.sender_id = None;
        assert_eq!(
            h.dispatcher.handle(msg).await.unwrap(),
            DispatchOutcome::UnresolvedSender
        );
        assert!(h.channel.sent().is_empty());
        assert_eq!(h.completion.calls(), 0);
    }

    #[tokio::test]
    async fn own_and_non_text_messages_are_ignored() {
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying("x"));
        let mut own = private("echo");
        own.from_self = true;
        assert!(matches!(
            h.dispatcher.handle(own).await.unwrap(),
            DispatchOutcome::Ignored(_)
        ));
        let mut photo = private("");
        photo.kind = InboundMessageKind::Other;
        assert!(matches!(
            h.dispatcher.handle(photo).await.unwrap(),
            DispatchOutcome::Ignored(_)
        ));
        assert_eq!(h.completion.calls(), 0);
    }

    #[tokio::test]
    async fn join_event_is_welcomed_unless_disabled() {
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying("x"));
        let mut join = message(ChatScope::Group, "Cy, Dee");
        join.kind = InboundMessageKind::JoinGroup;
        assert_eq!(
            h.dispatcher.handle(join.clone()).await.unwrap(),
            DispatchOutcome::Welcomed
        );
        assert!(h.channel.sent()[0].1.content.contains("Cy, Dee"));
        assert_eq!(h.quota.count(ChatScope::Group), 0);

        let h = harness(
            ChatConfig {
                welcome_to_group: false,
                ..ChatConfig::default()
            },
            ScriptedCompletion::replying("x"),
        );
        assert!(matches!(
            h.dispatcher.handle(join).await.unwrap(),
            DispatchOutcome::Ignored(_)
        ));
        assert!(h.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn chat_settings_are_read_fresh_per_message() {
        let path = std::env::temp_dir().join(format!("chatrelay-dispatch-{}.toml", uuid::Uuid::new_v4()));
        let h = harness_at(
            path.clone(),
            ChatConfig {
                private_limit: 1,
                ..ChatConfig::default()
            },
            ScriptedCompletion::replying("ok"),
        );
        h.dispatcher.handle(private("one")).await.unwrap();
        assert_eq!(
            h.dispatcher.handle(private("two")).await.unwrap(),
            DispatchOutcome::QuotaExceeded
        );

        std::fs::write(
            &path,
            r#"
[llm]
model = "gpt-4o-mini"
api_key = "test-key"

[chat]
private_limit = 5
"#,
        )
        .unwrap();
        assert!(h.config.reload().await.unwrap());
        assert_eq!(
            h.dispatcher.handle(private("three")).await.unwrap(),
            DispatchOutcome::Replied
        );
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn run_loop_spawns_handlers_and_stops_on_cancel() {
        let h = harness(ChatConfig::default(), ScriptedCompletion::replying("ok"));
        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.dispatcher.clone().run(rx, shutdown.clone()));

        tx.send(private("hi")).await.unwrap();
        for _ in 0..100 {
            if !h.channel.sent().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(h.channel.sent().len(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
