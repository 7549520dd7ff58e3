//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;

use crate::error::Error;
use crate::message::{ConversationItem, Message, Usage};
use crate::provider::{
    ByteStream, CompletionRequest, CompletionResponse, FinishReason, Generator, Provider,
};
use crate::tool::{Tool, ToolDefinition, ToolParameters};

/// Build a byte stream from string chunks.
pub fn byte_stream<I, S>(chunks: I) -> ByteStream
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let chunks: Vec<Result<Vec<u8>, Error>> = chunks
        .into_iter()
        .map(|c| Ok(c.into().into_bytes()))
        .collect();
    Box::pin(futures::stream::iter(chunks))
}

/// Build a byte stream that yields `text` split into pieces of `size` bytes.
pub fn split_stream(text: &str, size: usize) -> ByteStream {
    let chunks: Vec<Result<Vec<u8>, Error>> = text
        .as_bytes()
        .chunks(size.max(1))
        .map(|c| Ok(c.to_vec()))
        .collect();
    Box::pin(futures::stream::iter(chunks))
}

/// Drain a byte stream into a (lossily decoded) string. Errors are skipped.
pub async fn collect_stream(mut stream: ByteStream) -> String {
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        if let Ok(chunk) = chunk {
            bytes.extend(chunk);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// A mock provider that returns pre-configured responses.
pub struct MockProvider {
    responses: Mutex<VecDeque<CompletionResponse>>,
    streams: Mutex<VecDeque<Vec<Vec<u8>>>>,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<CompletionRequest>>,
    pub name: String,
    pub default_model: Option<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            captured_requests: Mutex::new(Vec::new()),
            name: "mock".to_string(),
            default_model: None,
        }
    }

    /// Queue a response for the next complete() call (FIFO).
    pub fn queue_response(&self, content: &str) {
        self.responses.lock().unwrap().push_back(CompletionResponse {
            message: Message::assistant(content),
            usage: Usage::new(0, 0),
            model: "mock-model".to_string(),
            finish_reason: FinishReason::Stop,
        });
    }

    /// Queue raw chunks for the next stream() call (FIFO).
    pub fn queue_stream(&self, chunks: Vec<Vec<u8>>) {
        self.streams.lock().unwrap().push_back(chunks);
    }

    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        self.captured_requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Unknown("No mock response queued".to_string()))
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ByteStream, Error> {
        self.captured_requests.lock().unwrap().push(request);
        let chunks = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Unknown("No mock stream queued".to_string()))?;
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }
}

/// A scripted *generate* callback.
///
/// Each call pops the next queued stream; once the queue is empty the
/// `repeat` script (if any) is replayed, otherwise the call fails.
pub struct MockGenerator {
    scripts: Mutex<VecDeque<Result<Vec<String>, String>>>,
    repeat: Option<Vec<String>>,
    /// Conversations received, one per call.
    pub calls: Mutex<Vec<Vec<ConversationItem>>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            repeat: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A generator that answers every call with the same chunks.
    pub fn repeating<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            repeat: Some(chunks.into_iter().map(Into::into).collect()),
            ..Self::new()
        }
    }

    pub fn queue<I, S>(&self, chunks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scripts
            .lock()
            .unwrap()
            .push_back(Ok(chunks.into_iter().map(Into::into).collect()));
    }

    pub fn queue_error(&self, message: &str) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_conversation(&self) -> Option<Vec<ConversationItem>> {
        self.calls.lock().unwrap().last().cloned()
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, conversation: &[ConversationItem]) -> Result<ByteStream, Error> {
        self.calls.lock().unwrap().push(conversation.to_vec());
        let next = self.scripts.lock().unwrap().pop_front();
        match next {
            Some(Ok(chunks)) => Ok(byte_stream(chunks)),
            Some(Err(message)) => Err(Error::network(message)),
            None => match &self.repeat {
                Some(chunks) => Ok(byte_stream(chunks.clone())),
                None => Err(Error::Unknown("No mock stream queued".to_string())),
            },
        }
    }
}

type ToolFn = dyn Fn(Value) -> Result<Value, Error> + Send + Sync;

/// A tool backed by a closure, or one that never finishes.
pub struct FnTool {
    name: String,
    func: Option<Box<ToolFn>>,
    /// Arguments received, one per call.
    pub calls: Mutex<Vec<Value>>,
}

impl FnTool {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value, Error> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            func: Some(Box::new(func)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A tool whose execution never resolves.
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            func: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn into_arc(self) -> Arc<dyn Tool> {
        Arc::new(self)
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "test tool"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(&self.name, self.description()).with_parameters(ToolParameters::new())
    }

    async fn execute(&self, arguments: Value) -> Result<Value, Error> {
        self.calls.lock().unwrap().push(arguments.clone());
        match &self.func {
            Some(func) => func(arguments),
            None => futures::future::pending().await,
        }
    }
}
