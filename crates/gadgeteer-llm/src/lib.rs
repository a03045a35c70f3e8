//! Provider boundary for the gadgeteer runtime: the adapter trait and chunk
//! stream types, error classification, the retry engine, and the proactive
//! rate limiter.

pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod retry_after;

pub use provider::{
    estimate_message_tokens, estimate_tokens, ChatRequest, Chunk, ChunkStream, ProviderAdapter,
    ProviderError, ProviderResult, Usage,
};
pub use rate_limit::{LimitKind, RateLimitStats, RateLimiter};
pub use retry::{OnRetriesExhausted, RetryEngine, ShouldRetry};
pub use retry_after::parse_retry_after;
