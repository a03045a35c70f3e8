//! Agent runtime: the iteration driver and the services around it
//! (conversation management, execution tree, hook bus, context compaction,
//! sub-agent spawning).

pub mod compaction;
pub mod conversation;
pub mod driver;
pub mod error;
pub mod hooks;
pub mod mock;
pub mod spawner;
pub mod tree;

pub use compaction::{
    CompactionManager, CompactionReport, CompactionStrategy, HybridStrategy,
    SlidingWindowStrategy, StrategyContext, SummarizationStrategy,
    DEFAULT_SUMMARIZATION_PROMPT,
};
pub use conversation::Conversation;
pub use driver::{Agent, DriverConfig, RunOutcome, RunStatus};
pub use error::AgentError;
pub use hooks::{
    AfterLlmAction, AfterLlmErrorAction, AfterLlmResolution, AgentController, AgentInterceptor,
    AgentObserver, BeforeLlmAction, BeforeLlmResolution, HookBus, IdentityInterceptor,
};
pub use mock::{ScriptedProvider, ScriptedResponse};
pub use spawner::SubagentSpawner;
pub use tree::{
    ExecutionTree, GadgetState, ListenerId, NodeId, NodeKind, NodePayload, SubagentContext,
    TreeEvent, TreeEventKind, TreeListener, TreeNode,
};
