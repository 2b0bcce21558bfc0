//! Completion client for chatrelay.
//!
//! Pure HTTP client: one prompt in, one completion out.

mod anthropic;
mod client;
mod error;
mod openai;
mod types;

pub use client::{Completion, CompletionSettings, LlmClient, Provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
