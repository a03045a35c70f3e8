//! Context compaction: keep the conversation under the model's context
//! window by rewriting history through a pluggable strategy.
//!
//! Base messages are never rewritten, ordering is preserved, and the last
//! `preserve_recent_turns` turns always survive. At most one compaction runs
//! per iteration.

use crate::conversation::Conversation;
use crate::error::{AgentError, Result};
use futures::StreamExt;
use gadgeteer_core::{CompactionConfig, CompactionStrategyKind, Message, Role};
use gadgeteer_llm::{ChatRequest, ProviderAdapter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_SUMMARIZATION_PROMPT: &str = "\
You are compacting an agent conversation to free context space. Summarize \
the following conversation excerpt. Preserve: decisions made, gadget calls \
and their essential results, open tasks, and any facts later turns may rely \
on. Omit pleasantries and dead ends. Reply with the summary only.";

/// What a compaction did, for observers and the execution tree.
#[derive(Clone, Debug)]
pub struct CompactionReport {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub messages_before: usize,
    pub messages_after: usize,
}

/// Inputs a strategy may use while rewriting history.
pub struct StrategyContext<'a> {
    pub provider: &'a Arc<dyn ProviderAdapter>,
    /// Model used for token counting, and for summarization unless the
    /// config names a cheaper one.
    pub model: &'a str,
    pub summarization_model: Option<&'a str>,
    pub summarization_prompt: &'a str,
    pub preserve_recent_turns: usize,
    pub cancel: &'a CancellationToken,
}

/// A history rewrite. Receives the whole conversation read-only and returns
/// the replacement history.
#[async_trait::async_trait]
pub trait CompactionStrategy: Send + Sync {
    async fn compact(
        &self,
        conversation: &Conversation,
        target_history_tokens: usize,
        cx: &StrategyContext<'_>,
    ) -> Result<Vec<Message>>;
}

// ---------------------------------------------------------------------------
// Sliding window
// ---------------------------------------------------------------------------

/// Keep the most recent turns that fit the target; drop everything older.
pub struct SlidingWindowStrategy;

#[async_trait::async_trait]
impl CompactionStrategy for SlidingWindowStrategy {
    async fn compact(
        &self,
        conversation: &Conversation,
        target_history_tokens: usize,
        cx: &StrategyContext<'_>,
    ) -> Result<Vec<Message>> {
        let history = conversation.history_messages();
        let total_turns = history.iter().filter(|m| m.role == Role::Assistant).count();

        // Largest turn count that fits, never below the preserved floor.
        let mut keep = total_turns.max(cx.preserve_recent_turns);
        while keep > cx.preserve_recent_turns {
            let boundary = conversation.turn_boundary(keep);
            let tail = &history[boundary..];
            if cx.provider.count_tokens(cx.model, tail) <= target_history_tokens {
                break;
            }
            keep -= 1;
        }

        let boundary = conversation.turn_boundary(keep);
        debug!(
            kept_turns = keep,
            dropped_messages = boundary,
            "sliding-window compaction"
        );
        Ok(history[boundary..].to_vec())
    }
}

// ---------------------------------------------------------------------------
// Summarization
// ---------------------------------------------------------------------------

/// Replace the drop-off region with an LLM-written summary message.
pub struct SummarizationStrategy;

impl SummarizationStrategy {
    async fn summarize(region: &[Message], cx: &StrategyContext<'_>) -> Result<String> {
        let rendered: Vec<String> = region
            .iter()
            .map(|m| format!("[{}] {}", m.role, m.text()))
            .collect();
        let request = ChatRequest {
            model: cx.summarization_model.unwrap_or(cx.model).to_string(),
            system: Some(cx.summarization_prompt.to_string()),
            messages: vec![Message::user(rendered.join("\n"))],
            ..Default::default()
        };

        let mut stream = cx.provider.stream(request, cx.cancel.clone()).await?;
        let mut summary = String::new();
        while let Some(chunk) = stream.next().await {
            summary.push_str(&chunk?.text);
        }
        Ok(summary)
    }
}

#[async_trait::async_trait]
impl CompactionStrategy for SummarizationStrategy {
    async fn compact(
        &self,
        conversation: &Conversation,
        _target_history_tokens: usize,
        cx: &StrategyContext<'_>,
    ) -> Result<Vec<Message>> {
        let history = conversation.history_messages();
        let boundary = conversation.turn_boundary(cx.preserve_recent_turns);
        if boundary == 0 {
            // Nothing old enough to summarize.
            return Ok(history.to_vec());
        }

        let summary = Self::summarize(&history[..boundary], cx).await?;
        let mut new_history =
            vec![Message::system(format!("Summary of earlier conversation:\n{}", summary))];
        new_history.extend(history[boundary..].iter().cloned());
        Ok(new_history)
    }
}

// ---------------------------------------------------------------------------
// Hybrid
// ---------------------------------------------------------------------------

/// Summarize everything except the preserved tail; with too few turns to be
/// worth a summarization call, fall back to the sliding window.
pub struct HybridStrategy;

#[async_trait::async_trait]
impl CompactionStrategy for HybridStrategy {
    async fn compact(
        &self,
        conversation: &Conversation,
        target_history_tokens: usize,
        cx: &StrategyContext<'_>,
    ) -> Result<Vec<Message>> {
        let total_turns = conversation
            .history_messages()
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();
        if total_turns <= cx.preserve_recent_turns + 1 {
            SlidingWindowStrategy
                .compact(conversation, target_history_tokens, cx)
                .await
        } else {
            SummarizationStrategy
                .compact(conversation, target_history_tokens, cx)
                .await
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct CompactionManager {
    config: CompactionConfig,
    strategy: Arc<dyn CompactionStrategy>,
}

impl CompactionManager {
    pub fn new(config: CompactionConfig) -> Self {
        let strategy: Arc<dyn CompactionStrategy> = match config.strategy {
            CompactionStrategyKind::SlidingWindow => Arc::new(SlidingWindowStrategy),
            CompactionStrategyKind::Summarization => Arc::new(SummarizationStrategy),
            CompactionStrategyKind::Hybrid => Arc::new(HybridStrategy),
        };
        Self { config, strategy }
    }

    /// Swap in a custom strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn CompactionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Token count that triggers a compaction for the given window.
    pub fn threshold(&self, context_window: usize) -> usize {
        (context_window as f64 * self.config.trigger_threshold_percent / 100.0) as usize
    }

    /// Compact when usage crossed the trigger threshold. Returns what
    /// changed, or None when nothing needed doing.
    pub async fn check_and_compact(
        &self,
        conversation: &mut Conversation,
        provider: &Arc<dyn ProviderAdapter>,
        model: &str,
        context_window: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<CompactionReport>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let tokens_before = provider.count_tokens(model, &conversation.messages());
        if tokens_before < self.threshold(context_window) {
            return Ok(None);
        }
        self.compact_now(conversation, provider, model, context_window, cancel, tokens_before)
            .await
            .map(Some)
    }

    /// Compact unconditionally (the driver forces this when the compiled
    /// prompt plus the output budget cannot fit the window).
    pub async fn compact_now(
        &self,
        conversation: &mut Conversation,
        provider: &Arc<dyn ProviderAdapter>,
        model: &str,
        context_window: usize,
        cancel: &CancellationToken,
        tokens_before: usize,
    ) -> Result<CompactionReport> {
        let base_tokens = provider.count_tokens(model, conversation.base_messages());
        let target_total = (context_window as f64 * self.config.target_percent / 100.0) as usize;
        let target_history_tokens = target_total.saturating_sub(base_tokens);
        let messages_before = conversation.messages().len();

        let cx = StrategyContext {
            provider,
            model,
            summarization_model: self.config.summarization_model.as_deref(),
            summarization_prompt: self
                .config
                .summarization_prompt
                .as_deref()
                .unwrap_or(DEFAULT_SUMMARIZATION_PROMPT),
            preserve_recent_turns: self.config.preserve_recent_turns,
            cancel,
        };
        let new_history = self
            .strategy
            .compact(conversation, target_history_tokens, &cx)
            .await?;

        conversation.replace_history(new_history);
        let tokens_after = provider.count_tokens(model, &conversation.messages());
        let report = CompactionReport {
            tokens_before,
            tokens_after,
            messages_before,
            messages_after: conversation.messages().len(),
        };
        info!(
            tokens_before = report.tokens_before,
            tokens_after = report.tokens_after,
            "compacted conversation history"
        );
        Ok(report)
    }
}

// Custom strategies come from embedders; make the failure path easy.
impl AgentError {
    pub fn compaction(message: impl Into<String>) -> Self {
        AgentError::Compaction(message.into())
    }
}
