//! Hot-reloadable configuration handle.
//!
//! The dispatcher takes a fresh snapshot per decision; a watcher task re-reads
//! the file and swaps in valid changes.

use crate::config::RelayConfig;
use anyhow::Result;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ConfigControl {
    path: PathBuf,
    state: RwLock<ConfigState>,
}

struct ConfigState {
    config: Arc<RelayConfig>,
    base_hash: String,
}

impl ConfigControl {
    pub fn new(path: PathBuf, config: RelayConfig) -> Result<Self> {
        let base_hash = hash_config(&config)?;
        Ok(Self {
            path,
            state: RwLock::new(ConfigState {
                config: Arc::new(config),
                base_hash,
            }),
        })
    }

    pub async fn current(&self) -> Arc<RelayConfig> {
        self.state.read().await.config.clone()
    }

    /// Content hash of the config currently applied.
    pub async fn base_hash(&self) -> String {
        self.state.read().await.base_hash.clone()
    }

    /// Re-reads the file. Returns `true` when a changed, valid config was applied.
    pub async fn reload(&self) -> Result<bool> {
        let next = RelayConfig::load(Some(self.path.clone())).await?;
        let next_hash = hash_config(&next)?;

        let mut state = self.state.write().await;
        if next_hash == state.base_hash {
            return Ok(false);
        }
        state.base_hash = next_hash;
        state.config = Arc::new(next);
        tracing::info!(
            path = %self.path.display(),
            base_hash = %state.base_hash,
            private_limit = state.config.chat.private_limit,
            group_limit = state.config.chat.group_limit,
            "config reloaded"
        );
        Ok(true)
    }

    pub fn spawn_watcher(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("config watcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.reload().await {
                            tracing::warn!(%e, path = %self.path.display(), "config reload failed; keeping previous config");
                        }
                    }
                }
            }
        })
    }
}

fn hash_config(config: &RelayConfig) -> Result<String> {
    let bytes = serde_json::to_vec(config)?;
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    Ok(format!("{:016x}", hasher.finish()))
}
