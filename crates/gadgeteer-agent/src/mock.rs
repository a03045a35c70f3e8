//! ScriptedProvider — deterministic provider responses for testing.
//!
//! Each call to `stream` pops the next scripted response; when the script
//! runs out, a default text response is served. Text is streamed in small
//! chunks like a real provider, so parser and interceptor paths get
//! exercised.

use async_stream::stream;
use gadgeteer_llm::{
    estimate_tokens, ChatRequest, Chunk, ChunkStream, ProviderAdapter, ProviderError,
    ProviderResult, Usage,
};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

const CHUNK_BYTES: usize = 16;

/// One scripted model turn.
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    /// Stream this text in small chunks, then finish.
    Text(String),
    /// Stream exactly these chunks.
    Chunks(Vec<String>),
    /// Fail the call with a retryable overload error.
    RetryableError(String),
    /// Fail the call with a fatal auth error.
    FatalError(String),
}

pub struct ScriptedProvider {
    script: Mutex<Vec<ScriptedResponse>>,
    default_response: ScriptedResponse,
    calls: Mutex<usize>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    /// Serve the scripted responses in order, then the default.
    pub fn sequence(script: Vec<ScriptedResponse>) -> Self {
        Self {
            script: Mutex::new(script),
            default_response: ScriptedResponse::Text("(script exhausted)".into()),
            calls: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Serve the same response on every call.
    pub fn constant(response: ScriptedResponse) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            default_response: response,
            calls: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_response(&self) -> ScriptedResponse {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        if script.is_empty() {
            self.default_response.clone()
        } else {
            script.remove(0)
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports(&self, _model: &str) -> bool {
        true
    }

    async fn stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ChunkStream> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            *calls += 1;
        }
        {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            requests.push(request.clone());
        }

        let chunks: Vec<String> = match self.next_response() {
            ScriptedResponse::Text(text) => text
                .as_bytes()
                .chunks(CHUNK_BYTES)
                .map(|c| String::from_utf8_lossy(c).to_string())
                .collect(),
            ScriptedResponse::Chunks(chunks) => chunks,
            ScriptedResponse::RetryableError(message) => {
                return Err(ProviderError::Overloaded(message))
            }
            ScriptedResponse::FatalError(message) => {
                return Err(ProviderError::AuthFailed(message))
            }
        };

        let input_tokens = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.text()) as u64)
            .sum();
        let output_tokens: u64 = chunks.iter().map(|c| estimate_tokens(c) as u64).sum();

        Ok(Box::pin(stream! {
            for chunk in chunks {
                if cancel.is_cancelled() {
                    yield Err(ProviderError::Cancelled);
                    return;
                }
                yield Ok(Chunk::text(chunk));
            }
            yield Ok(Chunk {
                text: String::new(),
                usage: Some(Usage { input_tokens, output_tokens }),
                finish_reason: Some("end_turn".to_string()),
                reasoning: None,
            });
        }))
    }
}
