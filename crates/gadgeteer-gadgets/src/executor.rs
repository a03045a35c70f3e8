//! Gadget executor: runs a parsed batch honoring dependencies, parallelism
//! mode, per-call timeouts, and cancellation.
//!
//! Results always come back in parsed order; tree observers see event-time
//! order instead. Failures never escape as errors: every call produces an
//! outcome the LLM can read on the next turn.

use crate::call::ParsedGadgetCall;
use crate::context::{ExecutionContext, SpawnableAgent};
use crate::gadget::MediaOutput;
use crate::registry::GadgetRegistry;
use crate::store::OutputStore;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reference text the LLM sees when a block fails to parse.
pub const BLOCK_FORMAT_REFERENCE: &str = "\
Block Format Reference:
!!!GADGET_START:<name>[:<invocationId>[:<depId1>,<depId2>,...]]
!!!ARG:<path>
<value>
!!!GADGET_END

Paths are slash-separated; numeric components index into arrays. Values are
inferred: true/false, numbers, otherwise strings. Repeat a path to build an
array. Every block must declare at least the gadget name in its header.";

/// How a batch is scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

/// Executor knobs.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub mode: ExecutionMode,
    pub max_gadgets_per_response: Option<usize>,
    /// Fallback when a gadget declares no timeout of its own.
    pub default_timeout_ms: u64,
    /// Serialized results beyond this size go to the out-of-band store.
    pub max_result_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            max_gadgets_per_response: None,
            default_timeout_ms: 120_000,
            max_result_bytes: 50_000,
        }
    }
}

/// Why a call was skipped rather than run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    FailedDependency { dependency: String },
    MaxGadgetsExceeded,
    Denied,
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailedDependency { dependency } => {
                write!(f, "failed_dependency={}", dependency)
            }
            Self::MaxGadgetsExceeded => write!(f, "max_gadgets_exceeded"),
            Self::Denied => write!(f, "denied"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Classification carried on error outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GadgetErrorKind {
    Execution,
    Parse,
    SchemaValidation,
    UnknownGadget,
    Timeout,
}

/// What one invocation produced.
#[derive(Clone, Debug)]
pub enum GadgetOutcome {
    Success {
        text: String,
        cost_usd: Option<f64>,
        media: Vec<MediaOutput>,
        break_loop: bool,
    },
    Error {
        message: String,
        kind: GadgetErrorKind,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl GadgetOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self::Success {
            text: text.into(),
            cost_usd: None,
            media: Vec::new(),
            break_loop: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// A finished invocation: outcome plus timing, in terms the conversation
/// and the execution tree both understand.
#[derive(Clone, Debug)]
pub struct CompletedGadget {
    pub invocation_id: String,
    pub gadget_name: String,
    pub outcome: GadgetOutcome,
    pub execution_time_ms: u64,
}

impl CompletedGadget {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_success()
    }

    /// Body text appended to the conversation for this result.
    pub fn result_text(&self) -> String {
        match &self.outcome {
            GadgetOutcome::Success { text, .. } => text.clone(),
            GadgetOutcome::Error { message, .. } => format!("Error: {}", message),
            GadgetOutcome::Skipped { reason } => format!("Skipped: {}", reason),
        }
    }

    /// Whether this result signals loop termination.
    pub fn breaks_loop(&self) -> bool {
        matches!(
            self.outcome,
            GadgetOutcome::Success { break_loop: true, .. }
        )
    }
}

/// Controller decision before a gadget runs.
pub enum BeforeGadgetAction {
    Proceed,
    Skip { synthetic: GadgetOutcome },
}

impl BeforeGadgetAction {
    /// Deny the call outright.
    pub fn deny() -> Self {
        Self::Skip {
            synthetic: GadgetOutcome::Skipped {
                reason: SkipReason::Denied,
            },
        }
    }
}

/// Controller decision after a gadget ran.
pub enum AfterGadgetAction {
    Continue,
    Recover { fallback: GadgetOutcome },
}

/// Hook surface the executor consults. The agent crate's hook bus and
/// execution tree implement this; the default is a no-op.
#[async_trait::async_trait]
pub trait ExecutorHooks: Send + Sync {
    async fn before_gadget(&self, _call: &ParsedGadgetCall) -> BeforeGadgetAction {
        BeforeGadgetAction::Proceed
    }

    async fn after_gadget(
        &self,
        _call: &ParsedGadgetCall,
        _outcome: &GadgetOutcome,
    ) -> AfterGadgetAction {
        AfterGadgetAction::Continue
    }

    fn on_gadget_start(&self, _call: &ParsedGadgetCall) {}

    fn on_gadget_finished(&self, _call: &ParsedGadgetCall, _result: &CompletedGadget) {}
}

struct NoopHooks;

#[async_trait::async_trait]
impl ExecutorHooks for NoopHooks {}

/// Dependency-aware batch dispatcher. Cheap to clone; outcome memory is
/// shared across iterations so later batches can depend on earlier calls.
#[derive(Clone)]
pub struct GadgetExecutor {
    registry: Arc<GadgetRegistry>,
    store: Arc<OutputStore>,
    hooks: Arc<dyn ExecutorHooks>,
    host: Option<Arc<dyn SpawnableAgent>>,
    config: ExecutorConfig,
    depth: usize,
    completed: Arc<DashMap<String, bool>>,
}

impl GadgetExecutor {
    pub fn new(registry: Arc<GadgetRegistry>, config: ExecutorConfig) -> Self {
        Self {
            registry,
            store: Arc::new(OutputStore::new()),
            hooks: Arc::new(NoopHooks),
            host: None,
            config,
            depth: 0,
            completed: Arc::new(DashMap::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ExecutorHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_store(mut self, store: Arc<OutputStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_host(mut self, host: Arc<dyn SpawnableAgent>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn store(&self) -> &Arc<OutputStore> {
        &self.store
    }

    /// Run a batch. Results come back in parsed order regardless of
    /// completion order.
    pub async fn run(
        &self,
        batch: Vec<ParsedGadgetCall>,
        cancel: CancellationToken,
    ) -> Vec<CompletedGadget> {
        let cap = self.config.max_gadgets_per_response.unwrap_or(usize::MAX);
        let mut slots: Vec<Option<CompletedGadget>> = vec![None; batch.len()];

        // 1. Trim the batch; the tail is skipped in order.
        for (idx, call) in batch.iter().enumerate().skip(cap) {
            let skipped = self.skip(call, SkipReason::MaxGadgetsExceeded);
            self.record(&mut slots, idx, call, skipped);
        }

        let active: Vec<usize> = (0..batch.len().min(cap)).collect();
        match self.config.mode {
            ExecutionMode::Sequential => {
                self.run_sequential(&batch, active, &mut slots, &cancel).await
            }
            ExecutionMode::Parallel => {
                self.run_parallel(&batch, active, &mut slots, &cancel).await
            }
        }

        slots.into_iter().flatten().collect()
    }

    async fn run_sequential(
        &self,
        batch: &[ParsedGadgetCall],
        active: Vec<usize>,
        slots: &mut [Option<CompletedGadget>],
        cancel: &CancellationToken,
    ) {
        for idx in active {
            let call = &batch[idx];
            if cancel.is_cancelled() {
                let skipped = self.skip(call, SkipReason::Cancelled);
                self.record(slots, idx, call, skipped);
                continue;
            }
            if let Some(dependency) = self.failed_dependency(call, batch, idx, slots) {
                let skipped = self.skip(call, SkipReason::FailedDependency { dependency });
                self.record(slots, idx, call, skipped);
                continue;
            }
            let result = self.exec_one(call.clone(), cancel.clone()).await;
            self.record(slots, idx, call, result);
        }
    }

    async fn run_parallel(
        &self,
        batch: &[ParsedGadgetCall],
        mut waiting: Vec<usize>,
        slots: &mut [Option<CompletedGadget>],
        cancel: &CancellationToken,
    ) {
        let mut running: JoinSet<(usize, CompletedGadget)> = JoinSet::new();

        loop {
            // Start everything whose dependencies are settled; skip anything
            // whose dependency already failed.
            let mut still_waiting = Vec::new();
            for idx in waiting.drain(..) {
                let call = &batch[idx];
                if cancel.is_cancelled() {
                    let skipped = self.skip(call, SkipReason::Cancelled);
                    self.record(slots, idx, call, skipped);
                    continue;
                }
                match self.dependency_state(call, batch, idx, slots) {
                    DepState::Ready => {
                        let executor = self.clone();
                        let call = call.clone();
                        let cancel = cancel.clone();
                        running.spawn(async move {
                            let result = executor.exec_one(call, cancel).await;
                            (idx, result)
                        });
                    }
                    DepState::Failed(dependency) => {
                        let skipped =
                            self.skip(call, SkipReason::FailedDependency { dependency });
                        self.record(slots, idx, call, skipped);
                    }
                    DepState::Waiting => still_waiting.push(idx),
                }
            }
            waiting = still_waiting;

            if waiting.is_empty() && running.is_empty() {
                break;
            }

            // Every waiter depends on an earlier batch position, so some
            // task is always running here; join one and re-scan.
            match running.join_next().await {
                Some(Ok((idx, result))) => self.record(slots, idx, &batch[idx], result),
                Some(Err(join_error)) => {
                    warn!(error = %join_error, "gadget task panicked");
                }
                None => {
                    // No tasks but waiters remain: their dependencies can
                    // never settle. Skip them rather than spin.
                    for idx in waiting.drain(..) {
                        let call = &batch[idx];
                        let dependency = call
                            .dependencies
                            .first()
                            .cloned()
                            .unwrap_or_default();
                        let skipped =
                            self.skip(call, SkipReason::FailedDependency { dependency });
                        self.record(slots, idx, call, skipped);
                    }
                }
            }
        }
    }

    fn record(
        &self,
        slots: &mut [Option<CompletedGadget>],
        idx: usize,
        call: &ParsedGadgetCall,
        result: CompletedGadget,
    ) {
        self.completed
            .insert(result.invocation_id.clone(), result.succeeded());
        self.hooks.on_gadget_finished(call, &result);
        slots[idx] = Some(result);
    }

    fn skip(&self, call: &ParsedGadgetCall, reason: SkipReason) -> CompletedGadget {
        CompletedGadget {
            invocation_id: call.invocation_id.clone(),
            gadget_name: call.gadget_name.clone(),
            outcome: GadgetOutcome::Skipped { reason },
            execution_time_ms: 0,
        }
    }

    /// Sequential-mode dependency check: every earlier result is recorded.
    fn failed_dependency(
        &self,
        call: &ParsedGadgetCall,
        batch: &[ParsedGadgetCall],
        idx: usize,
        slots: &[Option<CompletedGadget>],
    ) -> Option<String> {
        match self.dependency_state(call, batch, idx, slots) {
            DepState::Failed(dep) => Some(dep),
            // Waiting cannot happen sequentially; treat it as unknown.
            DepState::Waiting => call.dependencies.first().cloned(),
            DepState::Ready => None,
        }
    }

    fn dependency_state(
        &self,
        call: &ParsedGadgetCall,
        batch: &[ParsedGadgetCall],
        idx: usize,
        slots: &[Option<CompletedGadget>],
    ) -> DepState {
        let positions: HashMap<&str, usize> = batch
            .iter()
            .enumerate()
            .map(|(i, c)| (c.invocation_id.as_str(), i))
            .collect();

        let mut waiting = false;
        for dep in &call.dependencies {
            match positions.get(dep.as_str()) {
                Some(&dep_idx) if dep_idx < idx => match &slots[dep_idx] {
                    Some(result) if result.succeeded() => {}
                    Some(_) => return DepState::Failed(dep.clone()),
                    None => waiting = true,
                },
                // Forward references and self-references violate the
                // declared-earlier rule.
                Some(_) => return DepState::Failed(dep.clone()),
                None => match self.completed.get(dep.as_str()) {
                    Some(succeeded) if *succeeded => {}
                    Some(_) => return DepState::Failed(dep.clone()),
                    None => return DepState::Failed(dep.clone()),
                },
            }
        }
        if waiting {
            DepState::Waiting
        } else {
            DepState::Ready
        }
    }

    /// Execute one call end to end: parse check, lookup, validation,
    /// controller consult, timed execution, controller recovery, size cap.
    async fn exec_one(&self, call: ParsedGadgetCall, cancel: CancellationToken) -> CompletedGadget {
        let started = Instant::now();
        self.hooks.on_gadget_start(&call);

        let outcome = self.exec_outcome(&call, &cancel).await;

        let outcome = match self.hooks.after_gadget(&call, &outcome).await {
            AfterGadgetAction::Continue => outcome,
            AfterGadgetAction::Recover { fallback } => {
                debug!(gadget = %call.gadget_name, "after-gadget controller recovered");
                fallback
            }
        };

        let outcome = self.cap_outcome(outcome);
        CompletedGadget {
            invocation_id: call.invocation_id.clone(),
            gadget_name: call.gadget_name.clone(),
            outcome,
            execution_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn exec_outcome(
        &self,
        call: &ParsedGadgetCall,
        cancel: &CancellationToken,
    ) -> GadgetOutcome {
        if let Some(parse_error) = &call.parse_error {
            return GadgetOutcome::Error {
                message: format!(
                    "Could not parse gadget block: {}\n\n{}",
                    parse_error, BLOCK_FORMAT_REFERENCE
                ),
                kind: GadgetErrorKind::Parse,
            };
        }

        let Some(gadget) = self.registry.get(&call.gadget_name) else {
            return GadgetOutcome::Error {
                message: self.registry.unknown_gadget_message(&call.gadget_name),
                kind: GadgetErrorKind::UnknownGadget,
            };
        };

        let params = call.parameters.clone().unwrap_or_else(|| serde_json::json!({}));
        if let Err(violations) = gadget.schema().validate(&params) {
            let breakdown: Vec<String> = violations.iter().map(|v| format!("- {}", v)).collect();
            let usage = self
                .registry
                .usage_text(&call.gadget_name)
                .unwrap_or_default();
            return GadgetOutcome::Error {
                message: format!(
                    "Invalid parameters for '{}':\n{}\n\n{}",
                    call.gadget_name,
                    breakdown.join("\n"),
                    usage
                ),
                kind: GadgetErrorKind::SchemaValidation,
            };
        }

        match self.hooks.before_gadget(call).await {
            BeforeGadgetAction::Proceed => {}
            BeforeGadgetAction::Skip { synthetic } => {
                debug!(gadget = %call.gadget_name, "before-gadget controller skipped");
                return synthetic;
            }
        }

        let timeout_ms = gadget.timeout_ms().unwrap_or(self.config.default_timeout_ms);
        let token = cancel.child_token();
        let mut ctx = ExecutionContext::new(token.clone(), call.invocation_id.clone(), self.depth);
        if let Some(host) = &self.host {
            ctx = ctx.with_host(host.clone());
        }

        tokio::select! {
            result = gadget.execute(params, &ctx) => match result {
                Ok(output) => {
                    let reported = ctx.reported_cost();
                    let cost_usd = match (output.cost_usd, reported > 0.0) {
                        (Some(c), true) => Some(c + reported),
                        (Some(c), false) => Some(c),
                        (None, true) => Some(reported),
                        (None, false) => None,
                    };
                    GadgetOutcome::Success {
                        text: output.text,
                        cost_usd,
                        media: output.media,
                        break_loop: output.break_loop,
                    }
                }
                Err(error) => GadgetOutcome::Error {
                    message: error.to_string(),
                    kind: GadgetErrorKind::Execution,
                },
            },
            _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
                token.cancel();
                ctx.run_cleanups();
                GadgetOutcome::Error {
                    message: format!("gadget '{}' timed out after {}ms", call.gadget_name, timeout_ms),
                    kind: GadgetErrorKind::Timeout,
                }
            }
            _ = cancel.cancelled() => {
                token.cancel();
                ctx.run_cleanups();
                GadgetOutcome::Skipped { reason: SkipReason::Cancelled }
            }
        }
    }

    fn cap_outcome(&self, outcome: GadgetOutcome) -> GadgetOutcome {
        match outcome {
            GadgetOutcome::Success {
                text,
                cost_usd,
                media,
                break_loop,
            } => GadgetOutcome::Success {
                text: self.store.cap(text, self.config.max_result_bytes),
                cost_usd,
                media,
                break_loop,
            },
            GadgetOutcome::Error { message, kind } => GadgetOutcome::Error {
                message: self.store.cap(message, self.config.max_result_bytes),
                kind,
            },
            skipped => skipped,
        }
    }
}

enum DepState {
    Ready,
    Waiting,
    Failed(String),
}
