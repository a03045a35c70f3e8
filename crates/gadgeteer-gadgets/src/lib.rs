//! Gadget layer of the gadgeteer runtime: the gadget trait and execution
//! context, the registry, the streaming call parser, and the dependency-aware
//! executor.

pub mod call;
pub mod context;
pub mod executor;
pub mod gadget;
pub mod parser;
pub mod registry;
pub mod store;

pub use call::{render_result_wire, ParsedGadgetCall, WireSyntax};
pub use context::{ExecutionContext, SpawnableAgent, SubagentRun, SubagentSpec};
pub use executor::{
    AfterGadgetAction, BeforeGadgetAction, CompletedGadget, ExecutionMode, ExecutorConfig,
    ExecutorHooks, GadgetErrorKind, GadgetExecutor, GadgetOutcome, SkipReason,
    BLOCK_FORMAT_REFERENCE,
};
pub use gadget::{Gadget, GadgetError, GadgetExample, GadgetOutput, GadgetResult, MediaOutput};
pub use parser::{ParseEvent, StreamParser};
pub use registry::GadgetRegistry;
pub use store::OutputStore;
