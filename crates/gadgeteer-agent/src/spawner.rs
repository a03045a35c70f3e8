//! Sub-agent spawner: lets a gadget run a nested agent that inherits the
//! parent's cancellation, shares its execution tree and rate limiter, and
//! chains the parent's observers beneath its own.

use crate::driver::{Agent, DriverConfig, RunStatus};
use crate::hooks::HookBus;
use crate::tree::{ExecutionTree, NodeId};
use dashmap::DashMap;
use gadgeteer_gadgets::{GadgetRegistry, SpawnableAgent, SubagentRun, SubagentSpec};
use gadgeteer_llm::{ProviderAdapter, RateLimiter, RetryEngine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SubagentSpawner {
    provider: Arc<dyn ProviderAdapter>,
    registry: Arc<GadgetRegistry>,
    parent_config: DriverConfig,
    rate_limiter: Arc<RateLimiter>,
    retry: Arc<RetryEngine>,
    parent_hooks: Arc<HookBus>,
    tree: Arc<ExecutionTree>,
    gadget_nodes: Arc<DashMap<String, NodeId>>,
    parent_cancel: CancellationToken,
}

impl SubagentSpawner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        provider: Arc<dyn ProviderAdapter>,
        registry: Arc<GadgetRegistry>,
        parent_config: DriverConfig,
        rate_limiter: Arc<RateLimiter>,
        retry: Arc<RetryEngine>,
        parent_hooks: Arc<HookBus>,
        tree: Arc<ExecutionTree>,
        gadget_nodes: Arc<DashMap<String, NodeId>>,
        parent_cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            registry,
            parent_config,
            rate_limiter,
            retry,
            parent_hooks,
            tree,
            gadget_nodes,
            parent_cancel,
        }
    }
}

/// Purpose-hash name for a child agent: a short kebab prefix from the prompt
/// plus a suffix for uniqueness, so nested runs stay addressable in logs.
fn subagent_name(prompt: &str) -> String {
    let prefix: String = prompt
        .split_whitespace()
        .filter(|w| w.len() > 1)
        .take(3)
        .map(|w| {
            w.to_lowercase()
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-");
    let prefix = if prefix.is_empty() {
        "subagent".to_string()
    } else {
        prefix.chars().take(20).collect()
    };
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &suffix[..5])
}

#[async_trait::async_trait]
impl SpawnableAgent for SubagentSpawner {
    async fn spawn_subagent(&self, spec: SubagentSpec) -> Result<SubagentRun, String> {
        let name = subagent_name(&spec.prompt);

        // Root the child under the spawning gadget's node so its events
        // carry the right depth and attribution.
        let parent_node = spec
            .parent_invocation
            .as_ref()
            .and_then(|invocation| self.gadget_nodes.get(invocation).map(|n| n.value().clone()))
            .unwrap_or_else(|| self.tree.root_id().clone());
        let child_root = self
            .tree
            .add_agent_root(&parent_node, &name)
            .ok_or_else(|| "parent node vanished from execution tree".to_string())?;

        let config = DriverConfig {
            agent_name: name.clone(),
            model: spec.model.clone().unwrap_or_else(|| self.parent_config.model.clone()),
            system_prompt: spec.system.clone(),
            max_iterations: spec
                .max_iterations
                .unwrap_or(self.parent_config.max_iterations),
            ..self.parent_config.clone()
        };

        let cancel = spec
            .cancel
            .clone()
            .unwrap_or_else(|| self.parent_cancel.child_token());

        debug!(name = %name, model = %config.model, "spawning subagent");
        let mut child = Agent::new(self.provider.clone(), self.registry.clone(), config)
            .with_rate_limiter(self.rate_limiter.clone())
            .with_retry_engine(self.retry.clone())
            .with_hooks(HookBus::new().with_parent(self.parent_hooks.clone()))
            .with_cancellation(cancel)
            .with_tree(self.tree.clone(), child_root);

        let outcome = child.run(&spec.prompt).await;
        if outcome.status == RunStatus::Failed {
            return Err(outcome
                .error
                .unwrap_or_else(|| "subagent run failed".to_string()));
        }

        info!(
            name = %name,
            iterations = outcome.iterations,
            tokens = outcome.usage.total(),
            "subagent finished"
        );
        Ok(SubagentRun {
            final_text: outcome.final_text,
            input_tokens: outcome.usage.input_tokens,
            output_tokens: outcome.usage.output_tokens,
        })
    }
}
