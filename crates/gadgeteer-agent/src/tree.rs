//! Execution tree: the hierarchical event log shared by an agent and every
//! sub-agent nested under it.
//!
//! The tree is the single observability surface. Hook observers are driven
//! from tree events, so a sub-agent's activity reaches its parent's
//! observers with the right depth and sub-agent attribution. Event dispatch
//! is serialized: one task drains a bounded channel and invokes listeners in
//! registration order; a slow consumer drops events with a warning rather
//! than stalling the runtime.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gadgeteer_gadgets::{CompletedGadget, GadgetOutcome, SkipReason};
use gadgeteer_llm::Usage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub type NodeId = String;

const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    AgentRoot,
    LlmCall,
    Gadget,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GadgetState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Node payload, by kind.
#[derive(Clone, Debug)]
pub enum NodePayload {
    AgentRoot {
        name: String,
    },
    LlmCall {
        iteration: usize,
        model: String,
        response: Option<String>,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    },
    Gadget {
        invocation_id: String,
        name: String,
        parameters: Option<serde_json::Value>,
        state: GadgetState,
        result: Option<String>,
        cost_usd: Option<f64>,
    },
}

#[derive(Clone, Debug)]
pub struct TreeNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub kind: NodeKind,
    pub depth: usize,
    /// Invocation id of the nearest ancestor gadget, for events emitted by
    /// sub-agents spawned under it.
    pub subagent_scope: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub payload: NodePayload,
}

/// Sub-agent attribution carried on events below a spawning gadget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubagentContext {
    pub gadget_invocation_id: String,
}

#[derive(Clone, Debug)]
pub enum TreeEventKind {
    AgentStarted { name: String },
    LlmCallStarted { iteration: usize, model: String },
    LlmCallCompleted {
        iteration: usize,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    },
    GadgetAdded { invocation_id: String, name: String },
    GadgetStarted { invocation_id: String, name: String },
    GadgetCompleted { invocation_id: String, name: String },
    GadgetFailed {
        invocation_id: String,
        name: String,
        message: String,
    },
    GadgetSkipped {
        invocation_id: String,
        name: String,
        reason: SkipReason,
    },
    Compaction { tokens_before: usize, tokens_after: usize },
}

#[derive(Clone, Debug)]
pub struct TreeEvent {
    pub node_id: NodeId,
    pub depth: usize,
    pub subagent: Option<SubagentContext>,
    pub kind: TreeEventKind,
}

/// Listener over the whole tree. Errors are logged, never propagated.
pub trait TreeListener: Send + Sync {
    fn on_event(&self, event: &TreeEvent) -> Result<(), String>;
}

impl<F> TreeListener for F
where
    F: Fn(&TreeEvent) -> Result<(), String> + Send + Sync,
{
    fn on_event(&self, event: &TreeEvent) -> Result<(), String> {
        self(event)
    }
}

pub type ListenerId = u64;

type ListenerList = Arc<RwLock<Vec<(ListenerId, Arc<dyn TreeListener>)>>>;

pub struct ExecutionTree {
    nodes: DashMap<NodeId, TreeNode>,
    children: DashMap<NodeId, Vec<NodeId>>,
    root_id: NodeId,
    event_tx: mpsc::Sender<TreeEvent>,
    listeners: ListenerList,
    next_listener: AtomicU64,
}

impl ExecutionTree {
    /// Create a tree with an agent root node and start the dispatch task.
    pub fn new(agent_name: &str) -> Arc<Self> {
        let (event_tx, mut event_rx) = mpsc::channel::<TreeEvent>(EVENT_QUEUE_CAPACITY);
        let listeners: ListenerList = Arc::new(RwLock::new(Vec::new()));

        let dispatch_listeners = listeners.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let snapshot: Vec<Arc<dyn TreeListener>> = {
                    let guard = dispatch_listeners
                        .read()
                        .unwrap_or_else(|e| e.into_inner());
                    guard.iter().map(|(_, l)| l.clone()).collect()
                };
                for listener in snapshot {
                    if let Err(error) = listener.on_event(&event) {
                        warn!(error = %error, "tree listener failed");
                    }
                }
            }
            debug!("execution tree dispatch stopped");
        });

        let root_id = new_node_id();
        let tree = Arc::new(Self {
            nodes: DashMap::new(),
            children: DashMap::new(),
            root_id: root_id.clone(),
            event_tx,
            listeners,
            next_listener: AtomicU64::new(1),
        });
        tree.nodes.insert(
            root_id.clone(),
            TreeNode {
                id: root_id.clone(),
                parent_id: None,
                kind: NodeKind::AgentRoot,
                depth: 0,
                subagent_scope: None,
                started_at: Utc::now(),
                ended_at: None,
                payload: NodePayload::AgentRoot {
                    name: agent_name.to_string(),
                },
            },
        );
        tree.emit(
            &root_id,
            TreeEventKind::AgentStarted {
                name: agent_name.to_string(),
            },
        );
        tree
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    pub fn get_node(&self, id: &str) -> Option<TreeNode> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Depth of a node; the path to the root is well-formed by construction.
    pub fn depth(&self, id: &str) -> Option<usize> {
        self.nodes.get(id).map(|n| n.depth)
    }

    // -----------------------------------------------------------------------
    // Node creation and completion
    // -----------------------------------------------------------------------

    fn insert_child(&self, parent_id: &str, kind: NodeKind, payload: NodePayload) -> Option<NodeId> {
        let (depth, scope) = {
            let parent = self.nodes.get(parent_id)?;
            let scope = match &parent.payload {
                NodePayload::Gadget { invocation_id, .. } => Some(invocation_id.clone()),
                _ => parent.subagent_scope.clone(),
            };
            (parent.depth + 1, scope)
        };
        let id = new_node_id();
        self.nodes.insert(
            id.clone(),
            TreeNode {
                id: id.clone(),
                parent_id: Some(parent_id.to_string()),
                kind,
                depth,
                subagent_scope: scope,
                started_at: Utc::now(),
                ended_at: None,
                payload,
            },
        );
        self.children
            .entry(parent_id.to_string())
            .or_default()
            .push(id.clone());
        Some(id)
    }

    /// Open an LLM-call node. Returns None if the parent is unknown.
    pub fn add_llm_call(&self, parent_id: &str, iteration: usize, model: &str) -> Option<NodeId> {
        let id = self.insert_child(
            parent_id,
            NodeKind::LlmCall,
            NodePayload::LlmCall {
                iteration,
                model: model.to_string(),
                response: None,
                finish_reason: None,
                usage: None,
            },
        )?;
        self.emit(
            &id,
            TreeEventKind::LlmCallStarted {
                iteration,
                model: model.to_string(),
            },
        );
        Some(id)
    }

    pub fn complete_llm_call(
        &self,
        node_id: &str,
        response: String,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    ) {
        let mut iteration = 0;
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.ended_at = Some(Utc::now());
            if let NodePayload::LlmCall {
                iteration: it,
                response: r,
                finish_reason: fr,
                usage: u,
                ..
            } = &mut node.payload
            {
                iteration = *it;
                *r = Some(response);
                *fr = finish_reason.clone();
                *u = usage;
            }
        }
        self.emit(
            node_id,
            TreeEventKind::LlmCallCompleted {
                iteration,
                finish_reason,
                usage,
            },
        );
    }

    /// Open a gadget node in `pending` state.
    pub fn add_gadget(
        &self,
        parent_id: &str,
        invocation_id: &str,
        name: &str,
        parameters: Option<serde_json::Value>,
    ) -> Option<NodeId> {
        let id = self.insert_child(
            parent_id,
            NodeKind::Gadget,
            NodePayload::Gadget {
                invocation_id: invocation_id.to_string(),
                name: name.to_string(),
                parameters,
                state: GadgetState::Pending,
                result: None,
                cost_usd: None,
            },
        )?;
        self.emit(
            &id,
            TreeEventKind::GadgetAdded {
                invocation_id: invocation_id.to_string(),
                name: name.to_string(),
            },
        );
        Some(id)
    }

    pub fn start_gadget(&self, node_id: &str) {
        let mut identity = None;
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            if let NodePayload::Gadget {
                invocation_id,
                name,
                state,
                ..
            } = &mut node.payload
            {
                *state = GadgetState::Running;
                identity = Some((invocation_id.clone(), name.clone()));
            }
        }
        if let Some((invocation_id, name)) = identity {
            self.emit(node_id, TreeEventKind::GadgetStarted { invocation_id, name });
        }
    }

    /// Close a gadget node from its completed result, whatever the outcome.
    pub fn finish_gadget(&self, node_id: &str, result: &CompletedGadget) {
        let kind = match &result.outcome {
            GadgetOutcome::Success { cost_usd, .. } => {
                self.close_gadget(node_id, GadgetState::Succeeded, result.result_text(), *cost_usd);
                TreeEventKind::GadgetCompleted {
                    invocation_id: result.invocation_id.clone(),
                    name: result.gadget_name.clone(),
                }
            }
            GadgetOutcome::Error { message, .. } => {
                self.close_gadget(node_id, GadgetState::Failed, result.result_text(), None);
                TreeEventKind::GadgetFailed {
                    invocation_id: result.invocation_id.clone(),
                    name: result.gadget_name.clone(),
                    message: message.clone(),
                }
            }
            GadgetOutcome::Skipped { reason } => {
                self.close_gadget(node_id, GadgetState::Skipped, result.result_text(), None);
                TreeEventKind::GadgetSkipped {
                    invocation_id: result.invocation_id.clone(),
                    name: result.gadget_name.clone(),
                    reason: reason.clone(),
                }
            }
        };
        self.emit(node_id, kind);
    }

    fn close_gadget(&self, node_id: &str, new_state: GadgetState, text: String, cost: Option<f64>) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.ended_at = Some(Utc::now());
            if let NodePayload::Gadget {
                state,
                result,
                cost_usd,
                ..
            } = &mut node.payload
            {
                *state = new_state;
                *result = Some(text);
                *cost_usd = cost;
            }
        }
    }

    /// Root node for a sub-agent, parented under the spawning gadget's node.
    pub fn add_agent_root(&self, parent_gadget_node: &str, name: &str) -> Option<NodeId> {
        let id = self.insert_child(
            parent_gadget_node,
            NodeKind::AgentRoot,
            NodePayload::AgentRoot {
                name: name.to_string(),
            },
        )?;
        self.emit(
            &id,
            TreeEventKind::AgentStarted {
                name: name.to_string(),
            },
        );
        Some(id)
    }

    pub fn record_compaction(&self, tokens_before: usize, tokens_after: usize) {
        self.emit(
            &self.root_id.clone(),
            TreeEventKind::Compaction {
                tokens_before,
                tokens_after,
            },
        );
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    pub fn on_all(&self, listener: Arc<dyn TreeListener>) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        guard.push((id, listener));
        id
    }

    pub fn off_all(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = guard.len();
        guard.retain(|(lid, _)| *lid != id);
        guard.len() != before
    }

    fn emit(&self, node_id: &str, kind: TreeEventKind) {
        let (depth, subagent) = match self.nodes.get(node_id) {
            Some(node) => (
                node.depth,
                node.subagent_scope.clone().map(|gadget_invocation_id| {
                    SubagentContext { gadget_invocation_id }
                }),
            ),
            None => (0, None),
        };
        let event = TreeEvent {
            node_id: node_id.to_string(),
            depth,
            subagent,
            kind,
        };
        if self.event_tx.try_send(event).is_err() {
            warn!(node = %node_id, "tree event queue full, dropping event");
        }
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    /// Depth-indented snapshot for logs and diagnostics.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_node(&self.root_id, &mut out);
        out
    }

    fn render_node(&self, id: &str, out: &mut String) {
        if let Some(node) = self.nodes.get(id) {
            let label = match &node.payload {
                NodePayload::AgentRoot { name } => format!("agent: {}", name),
                NodePayload::LlmCall { iteration, model, .. } => {
                    format!("llm_call[{}]: {}", iteration, model)
                }
                NodePayload::Gadget {
                    invocation_id,
                    name,
                    state,
                    ..
                } => format!("gadget {} ({}) [{:?}]", name, invocation_id, state),
            };
            out.push_str(&"  ".repeat(node.depth));
            out.push_str(&label);
            out.push('\n');
        }
        let child_ids: Vec<NodeId> = self
            .children
            .get(id)
            .map(|children| children.value().clone())
            .unwrap_or_default();
        for child in child_ids {
            self.render_node(&child, out);
        }
    }
}

fn new_node_id() -> NodeId {
    format!("node_{}", Uuid::new_v4().simple())
}
