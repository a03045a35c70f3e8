//! Iteration driver: the per-turn state machine wiring rate limiting,
//! retries, streaming, parsing, gadget dispatch, hooks, and compaction.
//!
//! Each iteration: PREPARE (snapshot conversation, consult controllers) →
//! CALL (rate-limit acquire, provider stream under retry) → STREAM (feed the
//! parser, run interceptors) → POST/APPEND (assistant message, queued
//! messages) → DISPATCH (executor) → COMPACT → LOOP.

use crate::compaction::{CompactionManager, CompactionStrategy};
use crate::conversation::Conversation;
use crate::error::Result;
use crate::hooks::{AfterLlmErrorAction, BeforeLlmResolution, HookBus};
use crate::spawner::SubagentSpawner;
use crate::tree::{ExecutionTree, NodeId};
use dashmap::DashMap;
use futures::StreamExt;
use gadgeteer_core::{
    CompactionConfig, Message, RateLimitConfig, RetryConfig,
};
use gadgeteer_gadgets::{
    render_result_wire, AfterGadgetAction, BeforeGadgetAction, CompletedGadget, ExecutorConfig,
    ExecutorHooks, GadgetExecutor, GadgetOutcome, GadgetRegistry, ParseEvent, ParsedGadgetCall,
    StreamParser, WireSyntax,
};
use gadgeteer_llm::{ChatRequest, ProviderAdapter, RateLimiter, RetryEngine, Usage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Driver configuration for one agent.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub agent_name: String,
    pub model: String,
    pub max_iterations: usize,
    pub max_output_tokens: u32,
    pub context_window: usize,
    pub system_prompt: Option<String>,
    pub wire: WireSyntax,
    pub executor: ExecutorConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub compaction: CompactionConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            agent_name: "agent".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_iterations: 25,
            max_output_tokens: 8192,
            context_window: 200_000,
            system_prompt: None,
            wire: WireSyntax::default(),
            executor: ExecutorConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// The model produced no gadget calls, or a gadget flagged break_loop.
    Complete,
    Cancelled,
    IterationsExhausted,
    /// A non-recoverable failure (exhausted retries, controller rethrow,
    /// compaction failure). The outcome's `error` names it.
    Failed,
}

/// Summary of a finished run. Failures do not discard the run: a `Failed`
/// status still carries the iterations, usage, and text accumulated before
/// the error.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub iterations: usize,
    pub usage: Usage,
    pub cost_usd: f64,
    pub final_text: String,
    pub error: Option<String>,
}

/// The agent: provider, gadget catalog, shared services, and the loop.
pub struct Agent {
    provider: Arc<dyn ProviderAdapter>,
    registry: Arc<GadgetRegistry>,
    config: DriverConfig,
    rate_limiter: Arc<RateLimiter>,
    retry: Arc<RetryEngine>,
    hooks: Arc<HookBus>,
    compaction: CompactionManager,
    cancel: CancellationToken,
    /// Tree plus the node new children parent under. Created lazily unless a
    /// parent agent supplied its own (sub-agent case).
    tree: Option<(Arc<ExecutionTree>, NodeId)>,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn ProviderAdapter>,
        registry: Arc<GadgetRegistry>,
        config: DriverConfig,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let retry = Arc::new(RetryEngine::new(config.retry.clone()));
        let compaction = CompactionManager::new(config.compaction.clone());
        Self {
            provider,
            registry,
            config,
            rate_limiter,
            retry,
            hooks: Arc::new(HookBus::new()),
            compaction,
            cancel: CancellationToken::new(),
            tree: None,
        }
    }

    pub fn with_hooks(mut self, hooks: HookBus) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Share a rate limiter (one budget across an agent and its sub-agents).
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_retry_engine(mut self, retry: Arc<RetryEngine>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach to an existing tree under the given node (sub-agents).
    pub fn with_tree(mut self, tree: Arc<ExecutionTree>, root: NodeId) -> Self {
        self.tree = Some((tree, root));
        self
    }

    pub fn with_compaction_strategy(mut self, strategy: Arc<dyn CompactionStrategy>) -> Self {
        self.compaction = self.compaction.with_strategy(strategy);
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn tree(&mut self) -> Arc<ExecutionTree> {
        self.ensure_tree().0
    }

    fn ensure_tree(&mut self) -> (Arc<ExecutionTree>, NodeId) {
        if let Some(existing) = &self.tree {
            return existing.clone();
        }
        let tree = ExecutionTree::new(&self.config.agent_name);
        let root = tree.root_id().clone();
        self.tree = Some((tree.clone(), root.clone()));
        (tree, root)
    }

    /// Drive the loop for one user prompt until termination. Never errors:
    /// a non-recoverable failure ends the run with `RunStatus::Failed` and
    /// whatever partial state the loop had accumulated.
    pub async fn run(&mut self, user_prompt: &str) -> RunOutcome {
        let (tree, root_node) = self.ensure_tree();
        let depth = tree.depth(&root_node).unwrap_or(0);
        let gadget_nodes: Arc<DashMap<String, NodeId>> = Arc::new(DashMap::new());

        let driver_hooks = Arc::new(DriverHooks {
            bus: self.hooks.clone(),
            tree: tree.clone(),
            nodes: gadget_nodes.clone(),
        });
        let spawner = Arc::new(SubagentSpawner::new(
            self.provider.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.rate_limiter.clone(),
            self.retry.clone(),
            self.hooks.clone(),
            tree.clone(),
            gadget_nodes.clone(),
            self.cancel.clone(),
        ));
        let executor = GadgetExecutor::new(self.registry.clone(), self.config.executor.clone())
            .with_hooks(driver_hooks)
            .with_host(spawner)
            .with_depth(depth);

        let mut base = Vec::new();
        if let Some(system) = &self.config.system_prompt {
            base.push(Message::system(system.clone()));
        }
        base.push(Message::user(user_prompt.to_string()));
        let mut conversation = Conversation::new(base);

        let mut total_usage = Usage::default();
        let mut total_cost = 0.0_f64;
        let mut final_text = String::new();
        let mut iterations_run = 0;
        let mut run_error: Option<String> = None;

        let status = loop {
            let iteration = iterations_run;
            if self.cancel.is_cancelled() {
                break RunStatus::Cancelled;
            }

            // PREPARE: make sure prompt + output budget fit the window.
            let prompt_tokens = self
                .provider
                .count_tokens(&self.config.model, &conversation.messages());
            if prompt_tokens + self.config.max_output_tokens as usize > self.config.context_window
                && self.compaction.config().enabled
            {
                debug!(prompt_tokens, "prompt would overflow window, compacting early");
                match self
                    .compaction
                    .compact_now(
                        &mut conversation,
                        &self.provider,
                        &self.config.model,
                        self.config.context_window,
                        &self.cancel,
                        prompt_tokens,
                    )
                    .await
                {
                    Ok(report) => {
                        tree.record_compaction(report.tokens_before, report.tokens_after);
                        self.hooks.each_observer(|o| o.on_compaction(&report));
                    }
                    Err(error) => {
                        run_error = Some(error.to_string());
                        break RunStatus::Failed;
                    }
                }
            }

            let request = ChatRequest {
                model: self.config.model.clone(),
                messages: conversation.messages(),
                system: None,
                max_output_tokens: Some(self.config.max_output_tokens),
                temperature: None,
            };

            // PREPARE: controllers may rewrite or skip the call entirely.
            let turn = match self.hooks.run_before_llm(request).await {
                BeforeLlmResolution::Skip(synthetic_response) => {
                    debug!(iteration, "before-llm controller skipped the call");
                    StreamedTurn {
                        text: synthetic_response,
                        batch: Vec::new(),
                        usage: None,
                        cancelled: false,
                    }
                }
                BeforeLlmResolution::Proceed(request) => {
                    match self
                        .streamed_turn(iteration, request, &tree, &root_node, &gadget_nodes)
                        .await
                    {
                        Ok(turn) => turn,
                        Err(error) => {
                            run_error = Some(error.to_string());
                            break RunStatus::Failed;
                        }
                    }
                }
            };

            if let Some(usage) = turn.usage {
                total_usage.add(usage);
            }
            if turn.cancelled {
                // Keep the partial text; the transcript stays coherent.
                if !turn.text.is_empty() {
                    conversation.add_assistant_message(turn.text);
                }
                break RunStatus::Cancelled;
            }

            // POST: assistant-message interceptors, then after-LLM controllers.
            let text = self.hooks.intercept_assistant_message(turn.text);
            let after = self.hooks.run_after_llm(text).await;

            // APPEND
            if !after.text.is_empty() {
                final_text = after.text.clone();
                conversation.add_assistant_message(after.text);
            }

            // DISPATCH: run the batch, then append results in parsed order.
            let batch_empty = turn.batch.is_empty();
            let results = executor.run(turn.batch, self.cancel.clone()).await;
            let mut break_loop = false;
            for result in results {
                let result = self.hooks.intercept_gadget_result(result);
                if let GadgetOutcome::Success { cost_usd: Some(cost), .. } = &result.outcome {
                    total_cost += cost;
                }
                break_loop |= result.breaks_loop();
                let is_error = result.outcome.is_error();
                let wire = render_result_wire(&result.invocation_id, &result.result_text());
                conversation.add_gadget_call_result(result.invocation_id.clone(), wire, is_error);
            }

            // Controller-queued messages apply after the batch, before the
            // next PREPARE.
            for message in after.queued_messages {
                conversation.push_message(message);
            }

            // COMPACT
            match self
                .compaction
                .check_and_compact(
                    &mut conversation,
                    &self.provider,
                    &self.config.model,
                    self.config.context_window,
                    &self.cancel,
                )
                .await
            {
                Ok(Some(report)) => {
                    tree.record_compaction(report.tokens_before, report.tokens_after);
                    self.hooks.each_observer(|o| o.on_compaction(&report));
                }
                Ok(None) => {}
                Err(error) => {
                    iterations_run += 1;
                    run_error = Some(error.to_string());
                    break RunStatus::Failed;
                }
            }

            iterations_run += 1;

            // LOOP
            if self.cancel.is_cancelled() {
                break RunStatus::Cancelled;
            }
            if batch_empty || break_loop {
                break RunStatus::Complete;
            }
            if iterations_run >= self.config.max_iterations {
                break RunStatus::IterationsExhausted;
            }
        };

        info!(
            status = ?status,
            iterations = iterations_run,
            input_tokens = total_usage.input_tokens,
            output_tokens = total_usage.output_tokens,
            "agent run finished"
        );
        RunOutcome {
            status,
            iterations: iterations_run,
            usage: total_usage,
            cost_usd: total_cost,
            final_text,
            error: run_error,
        }
    }

    /// CALL + STREAM for one iteration.
    async fn streamed_turn(
        &self,
        iteration: usize,
        request: ChatRequest,
        tree: &Arc<ExecutionTree>,
        root_node: &NodeId,
        gadget_nodes: &Arc<DashMap<String, NodeId>>,
    ) -> Result<StreamedTurn> {
        let llm_node = tree.add_llm_call(root_node, iteration, &request.model);
        self.hooks
            .each_observer(|o| o.on_llm_call_start(iteration, &request));

        // CALL: wait out the rate limiter, reserve, then stream under retry.
        self.rate_limiter.acquire().await;
        let provider = self.provider.clone();
        let cancel = self.cancel.clone();
        let stream_result = self
            .retry
            .run(|| provider.stream(request.clone(), cancel.clone()))
            .await;

        let stream = match stream_result {
            Ok(stream) => stream,
            Err(error) => {
                self.hooks.each_observer(|o| o.on_llm_call_error(&error));
                match self.hooks.run_after_llm_error(&error).await {
                    AfterLlmErrorAction::Recover { fallback_response } => {
                        warn!(error = %error, "llm error recovered by controller");
                        if let Some(node) = &llm_node {
                            tree.complete_llm_call(
                                node,
                                fallback_response.clone(),
                                Some("recovered".to_string()),
                                None,
                            );
                        }
                        return Ok(StreamedTurn {
                            text: fallback_response,
                            batch: Vec::new(),
                            usage: None,
                            cancelled: false,
                        });
                    }
                    AfterLlmErrorAction::Rethrow => return Err(error.into()),
                }
            }
        };

        // STREAM
        let mut parser = StreamParser::new(self.config.wire.clone());
        let mut text = String::new();
        let mut batch: Vec<ParsedGadgetCall> = Vec::new();
        let mut usage: Option<Usage> = None;
        let mut finish_reason: Option<String> = None;
        let mut cancelled = false;

        tokio::pin!(stream);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(iteration, "llm stream cancelled");
                    cancelled = true;
                    break;
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        let Some(chunk) = self.hooks.intercept_raw_chunk(chunk) else {
                            continue;
                        };
                        self.hooks.each_observer(|o| o.on_stream_chunk(&chunk));
                        if let Some(u) = chunk.usage {
                            usage = Some(u);
                        }
                        if chunk.finish_reason.is_some() {
                            finish_reason = chunk.finish_reason.clone();
                        }
                        if !chunk.text.is_empty() {
                            self.handle_events(
                                parser.feed(&chunk.text),
                                &mut text,
                                &mut batch,
                                tree,
                                root_node,
                                gadget_nodes,
                            );
                        }
                    }
                    Some(Err(error)) => {
                        // Mid-stream failures surface to observers; the turn
                        // continues with what already arrived.
                        warn!(error = %error, "stream error mid-response");
                        self.hooks.each_observer(|o| o.on_llm_call_error(&error));
                    }
                    None => break,
                }
            }
        }

        if !cancelled {
            self.handle_events(
                parser.finalize(),
                &mut text,
                &mut batch,
                tree,
                root_node,
                gadget_nodes,
            );
        }

        // Account usage even when the provider reported none.
        let recorded = usage.unwrap_or_else(|| Usage {
            input_tokens: self
                .provider
                .count_tokens(&request.model, &request.messages) as u64,
            output_tokens: gadgeteer_llm::estimate_tokens(&text) as u64,
        });
        self.rate_limiter
            .record_usage(recorded.input_tokens, recorded.output_tokens);

        if let Some(node) = &llm_node {
            tree.complete_llm_call(node, text.clone(), finish_reason, Some(recorded));
        }
        self.hooks
            .each_observer(|o| o.on_llm_call_complete(iteration, &text, Some(recorded)));

        Ok(StreamedTurn {
            text,
            batch,
            usage: Some(recorded),
            cancelled,
        })
    }

    fn handle_events(
        &self,
        events: Vec<ParseEvent>,
        text: &mut String,
        batch: &mut Vec<ParsedGadgetCall>,
        tree: &Arc<ExecutionTree>,
        root_node: &NodeId,
        gadget_nodes: &Arc<DashMap<String, NodeId>>,
    ) {
        for event in events {
            match event {
                ParseEvent::Text(piece) => {
                    if let Some(piece) = self.hooks.intercept_text_chunk(piece) {
                        text.push_str(&piece);
                    }
                }
                ParseEvent::Call(call) => {
                    let call = self.hooks.intercept_gadget_parameters(call);
                    if let Some(node) = tree.add_gadget(
                        root_node,
                        &call.invocation_id,
                        &call.gadget_name,
                        call.parameters.clone(),
                    ) {
                        gadget_nodes.insert(call.invocation_id.clone(), node);
                    }
                    batch.push(call);
                }
            }
        }
    }
}

struct StreamedTurn {
    text: String,
    batch: Vec<ParsedGadgetCall>,
    usage: Option<Usage>,
    cancelled: bool,
}

/// Bridges the executor's hook surface onto the hook bus and the execution
/// tree.
struct DriverHooks {
    bus: Arc<HookBus>,
    tree: Arc<ExecutionTree>,
    nodes: Arc<DashMap<String, NodeId>>,
}

#[async_trait::async_trait]
impl ExecutorHooks for DriverHooks {
    async fn before_gadget(&self, call: &ParsedGadgetCall) -> BeforeGadgetAction {
        self.bus.run_before_gadget(call).await
    }

    async fn after_gadget(
        &self,
        call: &ParsedGadgetCall,
        outcome: &GadgetOutcome,
    ) -> AfterGadgetAction {
        self.bus.run_after_gadget(call, outcome).await
    }

    fn on_gadget_start(&self, call: &ParsedGadgetCall) {
        if let Some(node) = self.nodes.get(&call.invocation_id) {
            self.tree.start_gadget(&node);
        }
        self.bus
            .each_observer(|o| o.on_gadget_execution_start(call));
    }

    fn on_gadget_finished(&self, _call: &ParsedGadgetCall, result: &CompletedGadget) {
        if let Some(node) = self.nodes.get(&result.invocation_id) {
            self.tree.finish_gadget(&node, result);
        }
        match &result.outcome {
            GadgetOutcome::Skipped { .. } => {
                self.bus.each_observer(|o| o.on_gadget_skipped(result))
            }
            _ => self
                .bus
                .each_observer(|o| o.on_gadget_execution_complete(result)),
        }
    }
}
