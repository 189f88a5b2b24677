//! Provider capability and provider-facing resilience for Cadence.
//!
//! - [`Provider`] is the uniform chat/stream contract every AI vendor implements.
//! - [`ProviderRegistry`] maps provider ids to factories, populated explicitly at startup.
//! - [`RetryCoordinator`] classifies failures, computes jittered exponential
//!   backoff and suspends executions while a provider is down.
//! - [`ProviderHealthMonitor`] records per-provider availability.

pub mod backends;
/// Provider definitions read from config.
pub mod config;
pub mod health;
/// The provider contract and chat types.
pub mod provider;
/// Provider lookup by id.
pub mod registry;
/// Retry with backoff and provider waits.
pub mod retry;
/// Streaming chunks.
pub mod stream;

pub use backends::{SimulatedFailure, SimulatedProvider};
pub use config::{register_configured, ProviderConfig, ProviderKind};
pub use health::{HealthChangeCallback, HealthConfig, ProviderHealthMonitor};
pub use provider::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, ConnectionTest, Provider, TokenUsage,
    ToolCall,
};
pub use registry::{ProviderFactory, ProviderRegistry};
pub use retry::{
    is_retryable, retry_with_backoff, retry_with_backoff_blocking, retry_with_backoff_cancellable,
    NoopWaitObserver, OnRetry, ProviderWaitObserver, RetryAttempt, RetryConfig, RetryCoordinator,
};
pub use stream::{collect_stream, StreamChunk};
