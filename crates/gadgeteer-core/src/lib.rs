//! Core types shared by the gadgeteer runtime: messages, parameter schemas,
//! configuration records, and invocation-id allocation.

pub mod config;
pub mod id;
pub mod message;
pub mod schema;

pub use config::{
    CompactionConfig, CompactionStrategyKind, PartialCompactionConfig, PartialRateLimitConfig,
    PartialRetryConfig, RateLimitConfig, RetryConfig,
};
pub use id::next_invocation_id;
pub use message::{Content, ContentPart, Message, Role};
pub use schema::{Field, FieldViolation, ParamSchema, SchemaError};
