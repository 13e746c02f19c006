//! Streaming model boundary.
//!
//! A [`ModelClient`] turns one request into a channel of [`StreamEvent`]s.
//! The orchestrator consumes the channel; provider adapters (see
//! [`openai`]) and test doubles produce it.

pub mod openai;
pub mod sse;

use crate::error::ModelError;
use crate::types::{Message, ToolDefinition};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use openai::OpenAiClient;

/// Buffered events between a provider task and the orchestrator.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Events a model stream may produce, in arrival order.
///
/// A well-formed stream ends with `Complete`. Tool calls arrive complete,
/// with their JSON arguments still encoded as a string.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    RequestTokens { count: u64 },
    ResponseTokens { count: u64 },
    Reason { delta: String, tokens: u64 },
    /// Authoritative usage for the turn, when the provider reports it.
    Usage { prompt: u64, output: u64, reasoning: u64 },
    TextPartial { delta: String },
    TextComplete { text: String },
    /// The model restarted its answer; text streamed so far is void.
    TextReset,
    ToolStart { id: String, name: String },
    ToolCall { id: String, name: String, arguments: String },
    Complete,
}

pub type ModelEventStream = mpsc::Receiver<Result<StreamEvent, ModelError>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start one streamed completion.
    ///
    /// Errors before the first event (connection, status) are returned
    /// directly; later failures arrive as `Err` items on the channel.
    async fn stream(&self, request: ModelRequest) -> Result<ModelEventStream, ModelError>;
}
