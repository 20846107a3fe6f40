//! A deterministic client that replays queued responses.
//!
//! Used by tests and offline runs: every call pops the next response and the
//! request is kept so callers can inspect exactly what was sent.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::client::{LlmClient, LlmError};
use super::types::{CompletionRequest, CompletionResponse, TokenUsage};

pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<CompletionResponse, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    model: String,
}

impl ScriptedLlmClient {
    /// Queue plain text responses, one per call.
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue = responses.into_iter().map(|r| Ok(scripted(r.into()))).collect();

        Self {
            responses: Mutex::new(queue),
            requests: Mutex::new(Vec::new()),
            model: "scripted".to_string(),
        }
    }

    /// Queue one more response.
    pub fn push(&self, content: impl Into<String>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Ok(scripted(content.into())));
        }
    }

    /// Queue an error to be returned by the next unanswered call.
    pub fn push_error(&self, error: LlmError) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Err(error));
        }
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|r| r.len()).unwrap_or_default()
    }
}

fn scripted(content: String) -> CompletionResponse {
    CompletionResponse {
        content,
        usage: TokenUsage::new(10, 10),
        ..Default::default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let call = {
            let mut requests = self
                .requests
                .lock()
                .map_err(|_| LlmError::InvalidResponse("request log poisoned".to_string()))?;
            requests.push(request);
            requests.len()
        };

        let next = self
            .responses
            .lock()
            .map_err(|_| LlmError::InvalidResponse("response queue poisoned".to_string()))?
            .pop_front();

        next.unwrap_or(Err(LlmError::Exhausted { call }))
    }

    fn model(&self) -> &str {
        &self.model
    }
}
