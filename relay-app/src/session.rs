//! One-exchange conversational memory keyed by sender identity.
//!
//! Each identity holds only its latest (request, reply) pair; a new exchange
//! overwrites it. With a capacity set, least recently used identities are
//! evicted once the store grows past it.

use dashmap::DashMap;
use relay_channels::{ChannelId, GroupId, SenderId};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Who a conversation is with: a private user, or one member of one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SenderIdentity {
    Private {
        channel_id: ChannelId,
        user_id: SenderId,
    },
    Group {
        channel_id: ChannelId,
        group_id: GroupId,
        member_id: SenderId,
    },
}

impl fmt::Display for SenderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderIdentity::Private {
                channel_id,
                user_id,
            } => write!(f, "{channel_id}:{user_id}"),
            SenderIdentity::Group {
                channel_id,
                group_id,
                member_id,
            } => write!(f, "{channel_id}:{group_id}:{member_id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub last_request: String,
    pub last_reply: String,
    last_used: u64,
}

impl ConversationContext {
    /// The block prepended to the sender's next request.
    pub fn render(&self) -> String {
        format!("{}\n{}", self.last_request, self.last_reply)
    }
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SenderIdentity, ConversationContext>,
    /// 0 means unbounded.
    capacity: AtomicUsize,
    clock: AtomicU64,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.capacity
            .store(capacity.unwrap_or(0), Ordering::Relaxed);
    }

    /// Prior context for `identity`, or an empty string when there is none.
    pub fn context(&self, identity: &SenderIdentity) -> String {
        let tick = self.tick();
        match self.sessions.get_mut(identity) {
            Some(mut entry) => {
                entry.last_used = tick;
                entry.render()
            }
            None => String::new(),
        }
    }

    /// Replaces whatever was stored for `identity`.
    pub fn put(&self, identity: SenderIdentity, request: &str, reply: &str) {
        let context = ConversationContext {
            last_request: request.to_string(),
            last_reply: reply.to_string(),
            last_used: self.tick(),
        };
        self.sessions.insert(identity.clone(), context);
        self.evict_over_capacity(&identity);
    }

    #[cfg(test)]
    pub fn get(&self, identity: &SenderIdentity) -> Option<ConversationContext> {
        self.sessions.get(identity).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_over_capacity(&self, keep: &SenderIdentity) {
        let capacity = self.capacity.load(Ordering::Relaxed);
        if capacity == 0 {
            return;
        }
        while self.sessions.len() > capacity {
            // Pick the victim first; removing while iterating would deadlock the shard.
            let victim = self
                .sessions
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.value().last_used)
                .map(|entry| entry.key().clone());
            let Some(victim) = victim else {
                return;
            };
            self.sessions.remove(&victim);
            tracing::debug!(identity = %victim, capacity, "session evicted");
        }
    }
}
