use crate::provider::{ChatResponse, TokenUsage, ToolCall};
use cadence_core::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Chunks emitted during a streaming chat response.
///
/// These let consumers (e.g. a WebSocket adapter) relay partial output while
/// the provider is still generating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// A piece of assistant text.
    TextDelta {
        /// Text appended to the response.
        text: String,
    },

    /// The stream finished; carries the usage and any tool calls.
    Done {
        /// Tokens consumed by the whole call.
        usage: TokenUsage,
        /// Tools the model asked to call.
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
}

/// Drain a chunk stream into one [`ChatResponse`].
///
/// Fails on the first error chunk, or if the stream closes before `Done`.
pub async fn collect_stream(
    model: &str,
    rx: mpsc::Receiver<CadenceResult<StreamChunk>>,
) -> CadenceResult<ChatResponse> {
    let mut stream = ReceiverStream::new(rx);
    let mut content = String::new();

    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::TextDelta { text } => content.push_str(&text),
            StreamChunk::Done { usage, tool_calls } => {
                return Ok(ChatResponse {
                    model: model.to_string(),
                    content,
                    usage,
                    tool_calls,
                })
            }
        }
    }

    Err(CadenceError::Provider(
        "stream closed before the final chunk".into(),
    ))
}
