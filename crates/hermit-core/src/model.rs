//! Model client boundary
//!
//! The language model is an external capability: the engine hands over a
//! request and gets text back. Transport, authentication, timeouts and
//! retry policy all belong to the implementor behind this trait.

use async_trait::async_trait;
use serde::Serialize;

/// One message in the request payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelMessage {
    pub role: String,
    pub content: String,
}

/// Completion request the engine assembles from history.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ModelMessage>,
}

/// Raw completion text returned by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub content: String,
}

/// Opaque `complete(request) -> response` capability.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> anyhow::Result<ModelResponse>;
}
