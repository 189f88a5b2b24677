use crate::provider::{ChatRequest, ChatResponse, ConnectionTest, Provider, TokenUsage};
use crate::stream::StreamChunk;
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// A failure the simulated provider returns instead of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimulatedFailure {
    /// Provider reports an outage.
    Unavailable,
    /// Provider throttles the call.
    RateLimited {
        /// Suggested wait before retrying.
        #[serde(default)]
        retry_after_ms: Option<u64>,
    },
    /// Provider does not answer in time.
    Timeout,
    /// Unstructured vendor message, classified by substring.
    Message {
        /// Vendor error text.
        message: String,
    },
    /// Bad input; never retried.
    InvalidContext {
        /// What was wrong with the input.
        message: String,
    },
}

impl SimulatedFailure {
    fn into_error(self, provider: &str) -> CadenceError {
        match self {
            SimulatedFailure::Unavailable => CadenceError::ProviderUnavailable {
                provider: provider.to_string(),
                message: "simulated outage".into(),
            },
            SimulatedFailure::RateLimited { retry_after_ms } => CadenceError::RateLimited {
                provider: provider.to_string(),
                retry_after: retry_after_ms.map(Duration::from_millis),
            },
            SimulatedFailure::Timeout => {
                CadenceError::Timeout(format!("{provider} did not answer in time"))
            }
            SimulatedFailure::Message { message } => CadenceError::Provider(message),
            SimulatedFailure::InvalidContext { message } => CadenceError::ContextValidation(message),
        }
    }
}

/// Deterministic in-process provider.
///
/// Echoes the last user message, reports a rough token count and can be
/// scripted to fail the next N calls or to go offline entirely.
pub struct SimulatedProvider {
    id: String,
    latency: Duration,
    output_tokens: u64,
    available: AtomicBool,
    script: Mutex<VecDeque<SimulatedFailure>>,
    calls: AtomicU32,
}

impl SimulatedProvider {
    /// Always-available provider answering instantly with 256 tokens.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            latency: Duration::ZERO,
            output_tokens: 256,
            available: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report `output_tokens` completion tokens per call.
    pub fn with_output_tokens(mut self, output_tokens: u64) -> Self {
        self.output_tokens = output_tokens;
        self
    }

    /// Queue failures returned by the next calls, in order.
    pub fn with_failures(self, failures: impl IntoIterator<Item = SimulatedFailure>) -> Self {
        self.script.lock().extend(failures);
        self
    }

    /// Fail the next call with `failure`.
    pub fn fail_next(&self, failure: SimulatedFailure) {
        self.script.lock().push_back(failure);
    }

    /// Take the provider online or offline.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of chat calls received so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self, request: &ChatRequest) -> CadenceResult<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if !self.available.load(Ordering::SeqCst) {
            return Err(SimulatedFailure::Unavailable.into_error(&self.id));
        }
        let scripted = self.script.lock().pop_front();
        if let Some(failure) = scripted {
            return Err(failure.into_error(&self.id));
        }

        let prompt = request.last_user_message().unwrap_or_default();
        if prompt.trim().is_empty() {
            return Err(CadenceError::ContextValidation(
                "request has no user message".into(),
            ));
        }
        let input_tokens = request
            .messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum::<u64>()
            .max(1);
        let output_tokens = self.output_tokens.min(u64::from(request.max_tokens));

        Ok(ChatResponse {
            model: request.model.clone(),
            content: format!("[{}] {prompt}", self.id),
            usage: TokenUsage {
                input_tokens,
                output_tokens,
            },
            tool_calls: Vec::new(),
        })
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat(&self, request: &ChatRequest) -> CadenceResult<ChatResponse> {
        self.respond(request).await
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> CadenceResult<mpsc::Receiver<CadenceResult<StreamChunk>>> {
        let response = self.respond(request).await?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for word in response.content.split_inclusive(' ') {
                if tx
                    .send(Ok(StreamChunk::TextDelta {
                        text: word.to_string(),
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx
                .send(Ok(StreamChunk::Done {
                    usage: response.usage,
                    tool_calls: response.tool_calls,
                }))
                .await;
        });
        Ok(rx)
    }

    async fn test_connection(&self) -> ConnectionTest {
        if self.available.load(Ordering::SeqCst) {
            ConnectionTest::ok(self.latency.as_millis() as u64)
        } else {
            ConnectionTest::failed(format!("{} is unavailable", self.id))
        }
    }
}
