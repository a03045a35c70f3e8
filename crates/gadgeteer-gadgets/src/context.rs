//! Per-call execution context handed to gadgets, and the bridge trait a
//! gadget uses to spawn a nested agent.

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// What a finished sub-agent hands back to the spawning gadget.
#[derive(Clone, Debug)]
pub struct SubagentRun {
    pub final_text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Parameters for spawning a nested agent from inside a gadget.
#[derive(Clone, Debug, Default)]
pub struct SubagentSpec {
    pub prompt: String,
    pub system: Option<String>,
    pub model: Option<String>,
    pub max_iterations: Option<usize>,
    /// Child-supplied cancellation; when absent the parent's signal is
    /// inherited.
    pub cancel: Option<CancellationToken>,
    /// Invocation id of the spawning gadget; filled in by
    /// [`ExecutionContext::spawn_subagent`] so the child's tree nodes land
    /// under the right parent.
    pub parent_invocation: Option<String>,
}

/// Host surface that lets a gadget instantiate a nested agent sharing the
/// parent's execution tree, rate limiter, and cancellation. Implemented by
/// the agent crate.
#[async_trait::async_trait]
pub trait SpawnableAgent: Send + Sync {
    async fn spawn_subagent(&self, spec: SubagentSpec) -> Result<SubagentRun, String>;
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Context threaded through a single gadget execution.
pub struct ExecutionContext {
    signal: CancellationToken,
    invocation_id: String,
    depth: usize,
    cost_usd: Mutex<f64>,
    cleanups: Mutex<Vec<Cleanup>>,
    host: Option<Arc<dyn SpawnableAgent>>,
}

impl ExecutionContext {
    pub fn new(signal: CancellationToken, invocation_id: impl Into<String>, depth: usize) -> Self {
        Self {
            signal,
            invocation_id: invocation_id.into(),
            depth,
            cost_usd: Mutex::new(0.0),
            cleanups: Mutex::new(Vec::new()),
            host: None,
        }
    }

    pub fn with_host(mut self, host: Arc<dyn SpawnableAgent>) -> Self {
        self.host = Some(host);
        self
    }

    /// Cancellation signal for this call: the agent's signal combined with
    /// the per-gadget timeout.
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Host surface for spawning sub-agents, when the embedder wired one.
    pub fn host(&self) -> Option<&Arc<dyn SpawnableAgent>> {
        self.host.as_ref()
    }

    /// Spawn a nested agent under this invocation. Errors if the embedder
    /// wired no host.
    pub async fn spawn_subagent(&self, mut spec: SubagentSpec) -> Result<SubagentRun, String> {
        let Some(host) = &self.host else {
            return Err("no sub-agent host is available in this context".to_string());
        };
        spec.parent_invocation
            .get_or_insert_with(|| self.invocation_id.clone());
        if spec.cancel.is_none() {
            spec.cancel = Some(self.signal.child_token());
        }
        host.spawn_subagent(spec).await
    }

    /// Accumulate a dollar cost attributed to this invocation.
    pub fn report_cost(&self, usd: f64) {
        let mut cost = self.cost_usd.lock().unwrap_or_else(|e| e.into_inner());
        *cost += usd;
    }

    pub fn reported_cost(&self) -> f64 {
        *self.cost_usd.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a callback to run if this call is cancelled or times out.
    pub fn on_cleanup(&self, f: impl FnOnce() + Send + 'static) {
        let mut cleanups = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
        cleanups.push(Box::new(f));
    }

    /// Fire registered cleanups. Panics inside a cleanup are swallowed.
    pub(crate) fn run_cleanups(&self) {
        let cleanups: Vec<Cleanup> = {
            let mut guard = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for cleanup in cleanups {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(cleanup)).is_err() {
                warn!(invocation = %self.invocation_id, "gadget cleanup panicked");
            }
        }
    }
}
