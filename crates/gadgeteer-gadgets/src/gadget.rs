//! Gadget trait and result types.
//!
//! A gadget is a named, typed operation the LLM can invoke. Implement this
//! trait to add a new capability; register it with a GadgetRegistry before
//! the agent's first iteration.

use crate::context::ExecutionContext;
use gadgeteer_core::ParamSchema;
use serde_json::Value;

/// Result type for gadget execution
pub type GadgetResult<T> = Result<T, GadgetError>;

/// Gadget execution failure. Never escapes the executor; it is converted
/// into an error outcome the LLM sees on the next turn.
#[derive(Debug, thiserror::Error)]
pub enum GadgetError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

impl GadgetError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A non-text output produced by a gadget (image, audio).
#[derive(Clone, Debug)]
pub struct MediaOutput {
    pub media_type: String,
    pub data: String,
}

/// What a successful gadget execution returns.
#[derive(Clone, Debug, Default)]
pub struct GadgetOutput {
    pub text: String,
    pub cost_usd: Option<f64>,
    pub media: Vec<MediaOutput>,
    /// When set, the driver terminates the loop after this batch.
    pub break_loop: bool,
}

impl GadgetOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_cost(mut self, usd: f64) -> Self {
        self.cost_usd = Some(usd);
        self
    }

    pub fn with_break_loop(mut self) -> Self {
        self.break_loop = true;
        self
    }
}

/// A worked example shown to the LLM in usage messages.
#[derive(Clone, Debug)]
pub struct GadgetExample {
    pub description: String,
    pub parameters: Value,
}

/// The Gadget trait — implement this to add a new capability.
#[async_trait::async_trait]
pub trait Gadget: Send + Sync {
    /// Unique gadget name within a registry.
    fn name(&self) -> &str;

    /// Human-readable description sent to the LLM.
    fn description(&self) -> &str;

    /// Declared parameter shape. Validated against incoming calls.
    fn schema(&self) -> ParamSchema;

    /// Per-call timeout override. Falls back to the executor default.
    fn timeout_ms(&self) -> Option<u64> {
        None
    }

    /// Whether invoking this gadget has consequences worth flagging.
    fn dangerous(&self) -> bool {
        false
    }

    /// Worked examples for usage messages.
    fn examples(&self) -> Vec<GadgetExample> {
        Vec::new()
    }

    /// Execute the gadget. Long-running work should watch `ctx.signal()`
    /// and register cleanups for cancellation.
    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> GadgetResult<GadgetOutput>;
}
