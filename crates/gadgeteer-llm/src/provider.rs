//! Provider adapter trait and streaming types.
//!
//! The runtime never speaks a provider wire format itself; everything behind
//! [`ProviderAdapter`] is the embedder's concern. Errors coming back through
//! the trait carry enough shape (status, retry hint, message text) for the
//! retry engine to classify them.

use crate::retry_after::parse_retry_after;
use futures::Stream;
use gadgeteer_core::Message;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Provider error types
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed ({status:?}): {message}")]
    RequestFailed { status: Option<u16>, message: String },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("server overloaded: {0}")]
    Overloaded(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("cancelled")]
    Cancelled,
}

/// Textual markers that mean an error is worth retrying.
const RETRYABLE_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "econnreset",
    "econnrefused",
    "enotfound",
    "network",
    "overloaded",
    "capacity",
    "resource_exhausted",
    "quota exceeded",
    "unavailable",
    "deadline_exceeded",
];

/// Textual markers that mean retrying cannot help.
const FATAL_MARKERS: &[&str] = &[
    "content policy",
    "invalid",
    "unauthorized",
    "forbidden",
    "authentication",
    "permission denied",
];

impl ProviderError {
    /// HTTP-like status, when the adapter surfaced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RequestFailed { status, .. } => *status,
            Self::RateLimited { .. } => Some(429),
            Self::AuthFailed(_) => Some(401),
            _ => None,
        }
    }

    /// Whether the retry engine should schedule another attempt.
    /// Unknown errors are non-retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Overloaded(_) => true,
            Self::AuthFailed(_) | Self::Cancelled | Self::InvalidResponse(_) => false,
            Self::RequestFailed { status, message } => {
                if let Some(code) = status {
                    return matches!(code, 429 | 500 | 502 | 503 | 504);
                }
                classify_message(message).unwrap_or(false)
            }
            Self::StreamError(message) => classify_message(message).unwrap_or(false),
        }
    }

    /// Server-supplied retry hint, if one can be extracted.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, message } => {
                retry_after.or_else(|| parse_retry_after(message))
            }
            Self::RequestFailed { message, .. }
            | Self::Overloaded(message)
            | Self::StreamError(message) => parse_retry_after(message),
            _ => None,
        }
    }
}

/// Scan a message for retryability markers. None when nothing matched.
fn classify_message(message: &str) -> Option<bool> {
    let lower = message.to_lowercase();
    if FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(false);
    }
    if RETRYABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(true);
    }
    None
}

/// Token usage reported by the provider.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One streamed piece of a model response.
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    pub text: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    pub reasoning: Option<String>,
}

impl Chunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Request handed to the adapter for one model call.
#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            system: None,
            max_output_tokens: Some(8192),
            temperature: None,
        }
    }
}

/// Stream type for model responses
pub type ChunkStream = Pin<Box<dyn Stream<Item = ProviderResult<Chunk>> + Send>>;

const CHARS_PER_TOKEN: f32 = 4.0;
const MESSAGE_OVERHEAD_TOKENS: usize = 10;

/// Cheap token estimate for arbitrary text.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f32 / CHARS_PER_TOKEN).ceil() as usize
}

/// Cheap token estimate for a message list, with per-message overhead.
pub fn estimate_message_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| {
            (m.char_len() as f32 / CHARS_PER_TOKEN).ceil() as usize + MESSAGE_OVERHEAD_TOKENS
        })
        .sum()
}

/// Provider adapter trait. If `cancel` is triggered the adapter drops the
/// underlying connection and the stream yields `ProviderError::Cancelled`.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, model: &str) -> bool;

    async fn stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ChunkStream>;

    /// Count tokens for a prompt. The default estimate is `ceil(chars / 4)`
    /// plus a small per-message overhead; adapters with a real tokenizer
    /// should override.
    fn count_tokens(&self, _model: &str, messages: &[Message]) -> usize {
        estimate_message_tokens(messages)
    }
}
