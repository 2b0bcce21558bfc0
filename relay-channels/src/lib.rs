//! Chat platform adapters for chatrelay.
//!
//! Adapters are pure I/O: they convert platform updates into `InboundMessage`
//! events and deliver `OutboundMessage` replies.

mod telegram;
mod traits;
mod types;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    ChannelId, ChatScope, GroupId, InboundMessage, InboundMessageKind, MessageId,
    OutboundMessage, SenderId,
};
