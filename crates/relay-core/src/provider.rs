use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::{ConversationItem, Message, Usage};
use crate::tool::ToolDefinition;

/// Raw bytes from a backend (or to the delivery layer), in arrival order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, Error>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ConversationItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub stream: bool,
    /// Extra parameters passed through to the API untouched.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ConversationItem>) -> Self {
        Self {
            messages,
            model: None,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            stream: true,
            extra: HashMap::new(),
        }
    }

    /// One-shot request with a single user prompt, used for internal
    /// summarization calls.
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self::new(vec![Message::user(prompt).into()]).with_stream(false)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_extra(mut self, extra: HashMap<String, serde_json::Value>) -> Self {
        self.extra = extra;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub message: Message,
    pub usage: Usage,
    pub model: String,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

/// A text-generation backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Returns None if no default model is set (the API picks its own).
    fn default_model(&self) -> Option<&str>;

    /// Non-streaming completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error>;

    /// Streaming completion. The bytes are returned exactly as the backend
    /// sent them; interpreting them is a stream processor's job.
    async fn stream(&self, request: CompletionRequest) -> Result<ByteStream, Error>;
}

/// "Call the backend again": turns a conversation into a fresh byte stream.
///
/// Each implementation must produce the wire shape its paired stream processor
/// expects.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, conversation: &[ConversationItem]) -> Result<ByteStream, Error>;
}

/// A [`Generator`] backed by a [`Provider`]'s streaming endpoint.
pub struct ProviderGenerator {
    provider: Arc<dyn Provider>,
    model: Option<String>,
    tools: Vec<ToolDefinition>,
    extra: HashMap<String, serde_json::Value>,
}

impl ProviderGenerator {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            model: None,
            tools: Vec::new(),
            extra: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_extra(mut self, extra: HashMap<String, serde_json::Value>) -> Self {
        self.extra = extra;
        self
    }

    pub fn request(&self, conversation: &[ConversationItem]) -> CompletionRequest {
        let mut request = CompletionRequest::new(conversation.to_vec())
            .with_tools(self.tools.clone())
            .with_extra(self.extra.clone());
        if let Some(ref model) = self.model {
            request = request.with_model(model);
        }
        request
    }
}

#[async_trait]
impl Generator for ProviderGenerator {
    async fn generate(&self, conversation: &[ConversationItem]) -> Result<ByteStream, Error> {
        self.provider.stream(self.request(conversation)).await
    }
}
