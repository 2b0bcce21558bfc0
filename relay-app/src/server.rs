//! Process wiring for `chatrelay serve` and `chatrelay doctor`.

use crate::config::RelayConfig;
use crate::config_control::ConfigControl;
use crate::dispatcher::Dispatcher;
use crate::quota::QuotaTracker;
use crate::session::SessionStore;
use anyhow::Result;
use relay_channels::{ChannelAdapter, TelegramAdapter};
use relay_llm::{Completion, LlmClient};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    let client = LlmClient::new(cfg.completion_settings())
        .map_err(|e| anyhow::anyhow!("llm settings: {e}"))?;
    let channels = build_channels(&cfg)?;
    tracing::info!(
        config_path = %path.display(),
        model = %client.model(),
        provider = ?client.provider(),
        api_key_configured = !cfg.llm.api_key.trim().is_empty(),
        private_limit = cfg.chat.private_limit,
        group_limit = cfg.chat.group_limit,
        private_trigger_keyword = %cfg.chat.private_trigger_keyword,
        welcome_to_group = cfg.chat.welcome_to_group,
        session_max_entries = ?cfg.session.max_entries,
        channels = ?channels.keys().collect::<Vec<_>>(),
        "config ok"
    );
    if channels.is_empty() {
        tracing::warn!("no channels enabled; `serve` will refuse to start");
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = %cfg_path.display(),
        model = %cfg.llm.model,
        llm_timeout_seconds = cfg.llm.timeout_seconds,
        private_limit = cfg.chat.private_limit,
        group_limit = cfg.chat.group_limit,
        welcome_to_group = cfg.chat.welcome_to_group,
        session_max_entries = ?cfg.session.max_entries,
        telegram_enabled = cfg.channels.telegram.enabled,
        config_reload_interval_ms = cfg.runtime.config_reload_interval_ms,
        inbound_queue_capacity = cfg.runtime.inbound_queue_capacity,
        "server configuration loaded"
    );

    let completion: Arc<dyn Completion> = Arc::new(
        LlmClient::new(cfg.completion_settings())
            .map_err(|e| anyhow::anyhow!("llm settings: {e}"))?,
    );
    let channels = build_channels(&cfg)?;
    if channels.is_empty() {
        return Err(anyhow::anyhow!(
            "no channels enabled; set channels.telegram.enabled or TELEGRAM_BOT_TOKEN"
        ));
    }

    let config_control = Arc::new(ConfigControl::new(cfg_path, cfg.clone())?);
    tracing::debug!(base_hash = %config_control.base_hash().await, "config control ready");
    let sessions = Arc::new(SessionStore::new());
    sessions.set_capacity(cfg.session.max_entries);
    let quota = Arc::new(QuotaTracker::new());

    let (inbound_tx, inbound_rx) = mpsc::channel(cfg.runtime.inbound_queue_capacity);
    for (id, channel) in &channels {
        channel
            .start(inbound_tx.clone())
            .await
            .map_err(|e| anyhow::anyhow!("start channel {id}: {e}"))?;
        tracing::info!(channel = %id, "channel started");
    }
    drop(inbound_tx);

    let shutdown = CancellationToken::new();
    let watcher = config_control.clone().spawn_watcher(
        Duration::from_millis(cfg.runtime.config_reload_interval_ms),
        shutdown.clone(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        config_control,
        quota,
        sessions,
        completion,
        channels,
    ));
    let dispatch_loop = tokio::spawn(dispatcher.run(inbound_rx, shutdown.clone()));

    tracing::info!("chatrelay running");
    shutdown_signal(shutdown.clone()).await;

    if let Err(e) = dispatch_loop.await {
        tracing::warn!(%e, "dispatcher task ended abnormally");
    }
    if let Err(e) = watcher.await {
        tracing::warn!(%e, "config watcher task ended abnormally");
    }
    tracing::info!("chatrelay stopped");
    Ok(())
}

fn build_channels(cfg: &RelayConfig) -> Result<HashMap<String, Arc<dyn ChannelAdapter>>> {
    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    if cfg.channels.telegram.enabled {
        let adapter: Arc<dyn ChannelAdapter> =
            Arc::new(TelegramAdapter::new(&cfg.channels.telegram.bot_token)?);
        channels.insert(adapter.channel_id().to_string(), adapter);
    }
    Ok(channels)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        }
        tracing::warn!("received ctrl-c; beginning graceful shutdown");
    }
    shutdown.cancel();
}
