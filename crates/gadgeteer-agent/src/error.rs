//! Error type for the agent runtime surface.

use gadgeteer_llm::ProviderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("llm call failed: {0}")]
    Llm(#[from] ProviderError),

    #[error("compaction failed: {0}")]
    Compaction(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
