//! Hook bus: observers, interceptors, and controllers over the agent
//! lifecycle.
//!
//! Observers are fire-and-forget and may not alter anything; interceptors
//! transform values in registration order, each seeing the prior's output;
//! controllers can short-circuit a phase with a tagged action. Action types
//! are plain enums, so the "validate untyped plugin actions" boundary of a
//! dynamic host collapses into the type system here.

use crate::compaction::CompactionReport;
use gadgeteer_core::Message;
use gadgeteer_llm::{ChatRequest, Chunk, ProviderError, Usage};
use gadgeteer_gadgets::{
    AfterGadgetAction, BeforeGadgetAction, CompletedGadget, GadgetOutcome, ParsedGadgetCall,
};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Fire-and-forget lifecycle notifications. Default methods are no-ops, so
/// implementors override only what they watch.
pub trait AgentObserver: Send + Sync {
    fn on_llm_call_start(&self, _iteration: usize, _request: &ChatRequest) {}
    fn on_llm_call_complete(&self, _iteration: usize, _text: &str, _usage: Option<Usage>) {}
    fn on_llm_call_error(&self, _error: &ProviderError) {}
    fn on_gadget_execution_start(&self, _call: &ParsedGadgetCall) {}
    fn on_gadget_execution_complete(&self, _result: &CompletedGadget) {}
    fn on_gadget_skipped(&self, _result: &CompletedGadget) {}
    fn on_stream_chunk(&self, _chunk: &Chunk) {}
    fn on_compaction(&self, _report: &CompactionReport) {}
}

// ---------------------------------------------------------------------------
// Interceptors
// ---------------------------------------------------------------------------

/// Synchronous transforms over streamed and appended values. Chunk-level
/// interceptors may return None to suppress the value; message, parameter,
/// and result interceptors are total, because the driver must always append
/// something.
pub trait AgentInterceptor: Send + Sync {
    fn intercept_raw_chunk(&self, chunk: Chunk) -> Option<Chunk> {
        Some(chunk)
    }

    fn intercept_text_chunk(&self, text: String) -> Option<String> {
        Some(text)
    }

    fn intercept_assistant_message(&self, text: String) -> String {
        text
    }

    fn intercept_gadget_parameters(&self, call: ParsedGadgetCall) -> ParsedGadgetCall {
        call
    }

    fn intercept_gadget_result(&self, result: CompletedGadget) -> CompletedGadget {
        result
    }
}

/// The identity interceptor: every default method passes values through.
pub struct IdentityInterceptor;

impl AgentInterceptor for IdentityInterceptor {}

// ---------------------------------------------------------------------------
// Controllers
// ---------------------------------------------------------------------------

/// Decision before an LLM call.
pub enum BeforeLlmAction {
    Proceed { modified_request: Option<ChatRequest> },
    Skip { synthetic_response: String },
}

/// Decision after a streamed response.
pub enum AfterLlmAction {
    Continue,
    AppendMessages { messages: Vec<Message> },
    ModifyAndContinue { text: String },
    AppendAndModify { text: String, messages: Vec<Message> },
}

/// Decision after a non-retryable LLM error.
pub enum AfterLlmErrorAction {
    Rethrow,
    Recover { fallback_response: String },
}

/// Async decision points that can short-circuit a phase.
#[async_trait::async_trait]
pub trait AgentController: Send + Sync {
    async fn before_llm_call(&self, _request: &ChatRequest) -> BeforeLlmAction {
        BeforeLlmAction::Proceed {
            modified_request: None,
        }
    }

    async fn after_llm_call(&self, _text: &str) -> AfterLlmAction {
        AfterLlmAction::Continue
    }

    async fn after_llm_error(&self, _error: &ProviderError) -> AfterLlmErrorAction {
        AfterLlmErrorAction::Rethrow
    }

    async fn before_gadget_execution(&self, _call: &ParsedGadgetCall) -> BeforeGadgetAction {
        BeforeGadgetAction::Proceed
    }

    async fn after_gadget_execution(
        &self,
        _call: &ParsedGadgetCall,
        _outcome: &GadgetOutcome,
    ) -> AfterGadgetAction {
        AfterGadgetAction::Continue
    }
}

// ---------------------------------------------------------------------------
// The bus
// ---------------------------------------------------------------------------

/// Resolution of the before-LLM controller chain.
pub enum BeforeLlmResolution {
    Proceed(ChatRequest),
    Skip(String),
}

/// Accumulated effect of the after-LLM controller chain.
pub struct AfterLlmResolution {
    pub text: String,
    pub queued_messages: Vec<Message>,
}

/// Registered hooks, invoked in registration order. A child agent's bus can
/// chain its parent's observers beneath its own, and chains compose.
#[derive(Default)]
pub struct HookBus {
    observers: Vec<Arc<dyn AgentObserver>>,
    interceptors: Vec<Arc<dyn AgentInterceptor>>,
    controllers: Vec<Arc<dyn AgentController>>,
    parent: Option<Arc<HookBus>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn add_interceptor(mut self, interceptor: Arc<dyn AgentInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn add_controller(mut self, controller: Arc<dyn AgentController>) -> Self {
        self.controllers.push(controller);
        self
    }

    /// Chain a parent bus: parent observers run after this bus's own.
    pub fn with_parent(mut self, parent: Arc<HookBus>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Visit every observer: own first, then the parent chain.
    pub fn each_observer(&self, mut f: impl FnMut(&Arc<dyn AgentObserver>)) {
        let mut bus = Some(self);
        while let Some(current) = bus {
            for observer in &current.observers {
                f(observer);
            }
            bus = current.parent.as_deref();
        }
    }

    // -- interceptor chains -------------------------------------------------

    pub fn intercept_raw_chunk(&self, chunk: Chunk) -> Option<Chunk> {
        let mut value = chunk;
        for interceptor in &self.interceptors {
            value = interceptor.intercept_raw_chunk(value)?;
        }
        Some(value)
    }

    pub fn intercept_text_chunk(&self, text: String) -> Option<String> {
        let mut value = text;
        for interceptor in &self.interceptors {
            value = interceptor.intercept_text_chunk(value)?;
        }
        Some(value)
    }

    pub fn intercept_assistant_message(&self, text: String) -> String {
        self.interceptors
            .iter()
            .fold(text, |value, i| i.intercept_assistant_message(value))
    }

    pub fn intercept_gadget_parameters(&self, call: ParsedGadgetCall) -> ParsedGadgetCall {
        self.interceptors
            .iter()
            .fold(call, |value, i| i.intercept_gadget_parameters(value))
    }

    pub fn intercept_gadget_result(&self, result: CompletedGadget) -> CompletedGadget {
        self.interceptors
            .iter()
            .fold(result, |value, i| i.intercept_gadget_result(value))
    }

    // -- controller chains --------------------------------------------------

    /// Run the before-LLM controllers. A skip short-circuits; proceed
    /// modifications accumulate, each controller seeing the prior's request.
    pub async fn run_before_llm(&self, mut request: ChatRequest) -> BeforeLlmResolution {
        for controller in &self.controllers {
            match controller.before_llm_call(&request).await {
                BeforeLlmAction::Proceed {
                    modified_request: Some(modified),
                } => request = modified,
                BeforeLlmAction::Proceed {
                    modified_request: None,
                } => {}
                BeforeLlmAction::Skip { synthetic_response } => {
                    return BeforeLlmResolution::Skip(synthetic_response)
                }
            }
        }
        BeforeLlmResolution::Proceed(request)
    }

    /// Run the after-LLM controllers, accumulating text rewrites and queued
    /// messages.
    pub async fn run_after_llm(&self, text: String) -> AfterLlmResolution {
        let mut resolution = AfterLlmResolution {
            text,
            queued_messages: Vec::new(),
        };
        for controller in &self.controllers {
            match controller.after_llm_call(&resolution.text).await {
                AfterLlmAction::Continue => {}
                AfterLlmAction::AppendMessages { messages } => {
                    resolution.queued_messages.extend(messages)
                }
                AfterLlmAction::ModifyAndContinue { text } => resolution.text = text,
                AfterLlmAction::AppendAndModify { text, messages } => {
                    resolution.text = text;
                    resolution.queued_messages.extend(messages);
                }
            }
        }
        resolution
    }

    /// First controller that recovers wins; the default is rethrow.
    pub async fn run_after_llm_error(&self, error: &ProviderError) -> AfterLlmErrorAction {
        for controller in &self.controllers {
            if let AfterLlmErrorAction::Recover { fallback_response } =
                controller.after_llm_error(error).await
            {
                return AfterLlmErrorAction::Recover { fallback_response };
            }
        }
        AfterLlmErrorAction::Rethrow
    }

    /// First controller that skips wins.
    pub async fn run_before_gadget(&self, call: &ParsedGadgetCall) -> BeforeGadgetAction {
        for controller in &self.controllers {
            if let BeforeGadgetAction::Skip { synthetic } =
                controller.before_gadget_execution(call).await
            {
                return BeforeGadgetAction::Skip { synthetic };
            }
        }
        BeforeGadgetAction::Proceed
    }

    /// First controller that recovers wins.
    pub async fn run_after_gadget(
        &self,
        call: &ParsedGadgetCall,
        outcome: &GadgetOutcome,
    ) -> AfterGadgetAction {
        for controller in &self.controllers {
            if let AfterGadgetAction::Recover { fallback } =
                controller.after_gadget_execution(call, outcome).await
            {
                return AfterGadgetAction::Recover { fallback };
            }
        }
        AfterGadgetAction::Continue
    }
}
