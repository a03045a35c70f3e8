//! gadgeteer — an agent runtime for LLM-driven gadget orchestration.
//!
//! The workspace splits into four layers, re-exported here:
//!
//! - `core`: messages, parameter schemas, configuration records
//! - `llm`: the provider adapter boundary, retry engine, rate limiter
//! - `gadgets`: the gadget trait, registry, streaming call parser, and
//!   dependency-aware executor
//! - `agent`: the iteration driver, execution tree, hook bus, compaction,
//!   and sub-agent spawning
//!
//! A minimal embedding: build a [`gadgets::GadgetRegistry`], implement
//! [`llm::ProviderAdapter`] for your backend, construct an [`agent::Agent`],
//! and call `run` with a user prompt.

pub use gadgeteer_agent as agent;
pub use gadgeteer_core as core;
pub use gadgeteer_gadgets as gadgets;
pub use gadgeteer_llm as llm;

pub use gadgeteer_agent::{Agent, DriverConfig, HookBus, RunOutcome, RunStatus};
pub use gadgeteer_core::{Message, ParamSchema, Role};
pub use gadgeteer_gadgets::{ExecutionContext, Gadget, GadgetOutput, GadgetRegistry, WireSyntax};
pub use gadgeteer_llm::{ProviderAdapter, RateLimiter, RetryEngine};
