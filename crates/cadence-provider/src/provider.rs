use crate::stream::StreamChunk;
use async_trait::async_trait;
use cadence_core::CadenceResult;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Instructions to the model.
    System,
    /// The caller.
    User,
    /// The model.
    Assistant,
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author.
    pub role: ChatRole,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A chat completion request handed to a [`Provider`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model to run.
    pub model: String,
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Completion length cap.
    pub max_tokens: u32,
    /// Sampling temperature; `None` uses the provider default.
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ChatRequest {
    /// An empty request with a 4096-token cap.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            max_tokens: 4096,
            temperature: None,
        }
    }

    /// Append a message.
    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Cap the completion length.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Content of the last user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
    }
}

/// Token counts reported by a provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Prompt plus completion tokens.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments as JSON.
    pub arguments: serde_json::Value,
}

/// A complete, non-streamed chat completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Model that answered.
    pub model: String,
    /// Assistant text.
    pub content: String,
    /// Tokens consumed.
    pub usage: TokenUsage,
    /// Tools the model asked to call.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// Result of [`Provider::test_connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTest {
    /// Whether the provider answered.
    pub success: bool,
    /// Round-trip time when it did.
    pub latency_ms: Option<u64>,
    /// Failure message when it did not.
    pub error: Option<String>,
}

impl ConnectionTest {
    /// A successful probe taking `latency_ms`.
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    /// A failed probe.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

/// An external AI vendor exposed through a uniform chat/stream contract.
///
/// Vendors are plugged in through the [`ProviderRegistry`](crate::ProviderRegistry).
/// Implementations report transient failures with the recoverable
/// [`CadenceError`](cadence_core::CadenceError) variants so that the retry
/// coordinator can classify them.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry key, e.g. `openai`.
    fn id(&self) -> &str;

    /// Non-streaming chat completion.
    async fn chat(&self, request: &ChatRequest) -> CadenceResult<ChatResponse>;

    /// Streaming chat completion.
    ///
    /// Every chunk but the last carries partial content; the last one is a
    /// [`StreamChunk::Done`] with token counts and tool calls. The default
    /// implementation performs a blocking `chat` and replays it as a
    /// single-delta stream.
    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> CadenceResult<mpsc::Receiver<CadenceResult<StreamChunk>>> {
        let response = self.chat(request).await?;
        let (tx, rx) = mpsc::channel(2);
        // Capacity 2 holds both chunks, so neither send can fail on a full channel.
        let _ = tx.try_send(Ok(StreamChunk::TextDelta {
            text: response.content,
        }));
        let _ = tx.try_send(Ok(StreamChunk::Done {
            usage: response.usage,
            tool_calls: response.tool_calls,
        }));
        Ok(rx)
    }

    /// Cheap liveness probe used by the health monitor.
    async fn test_connection(&self) -> ConnectionTest;
}
