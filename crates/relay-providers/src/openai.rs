use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use relay_core::{
    ByteStream, CompletionRequest, CompletionResponse, ConversationItem, Error, FinishReason,
    Message, ResponseItem, Role, ToolCall, ToolDefinition, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Which OpenAI-compatible endpoint the provider talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenAIApi {
    /// `/chat/completions`: delta chunks, paired with `ChatDeltaProcessor`.
    #[default]
    ChatCompletions,
    /// `/responses`: typed SSE events, paired with `ResponsesProcessor`.
    Responses,
}

/// OpenAI-compatible HTTP backend.
///
/// `stream` hands back the response body untouched; the matching stream
/// processor does all parsing.
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: Option<String>,
    api: OpenAIApi,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        // Configure client for proper SSE streaming:
        // - Use HTTP/1.1 to avoid HTTP/2 framing issues
        // - Disable automatic decompression which can buffer entire response
        let client = Client::builder()
            .http1_only()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: None,
            api: OpenAIApi::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_api(mut self, api: OpenAIApi) -> Self {
        self.api = api;
        self
    }

    pub fn api(&self) -> OpenAIApi {
        self.api
    }

    fn endpoint(&self) -> String {
        match self.api {
            OpenAIApi::ChatCompletions => format!("{}/chat/completions", self.base_url),
            OpenAIApi::Responses => format!("{}/responses", self.base_url),
        }
    }

    fn body(&self, request: &CompletionRequest) -> Result<Value, Error> {
        let body = match self.api {
            OpenAIApi::ChatCompletions => serde_json::to_value(self.build_chat_request(request))?,
            OpenAIApi::Responses => serde_json::to_value(self.build_responses_request(request))?,
        };
        Ok(body)
    }

    fn build_chat_request(&self, request: &CompletionRequest) -> OpenAIChatRequest {
        // Model priority: request > provider default
        // If neither is set, don't send model field (let API use its default)
        let model = request
            .model
            .clone()
            .or_else(|| self.default_model.clone());

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(chat_tool).collect())
        };

        OpenAIChatRequest {
            model,
            messages: request.messages.iter().map(chat_message).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: Some(request.stream),
            tools,
            extra: request.extra.clone(),
        }
    }

    fn build_responses_request(&self, request: &CompletionRequest) -> OpenAIResponsesRequest {
        let model = request
            .model
            .clone()
            .or_else(|| self.default_model.clone());

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(responses_tool).collect())
        };

        OpenAIResponsesRequest {
            model,
            input: request.messages.iter().flat_map(responses_input).collect(),
            temperature: request.temperature,
            max_output_tokens: request.max_tokens,
            stream: request.stream,
            tools,
            extra: request.extra.clone(),
        }
    }

    fn parse_chat_response(&self, response: OpenAIChatResponse) -> Result<CompletionResponse, Error> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::api(500, "No choices in response"))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
            .collect();

        let content = choice.message.content.filter(|c| !c.is_empty());
        let message = if tool_calls.is_empty() {
            Message::assistant(content.unwrap_or_default())
        } else {
            Message::assistant_with_tool_calls(content, &tool_calls)
        };

        let finish_reason = match choice.finish_reason.as_deref() {
            Some("length") => FinishReason::Length,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        };

        let usage = response.usage.map(|u| Usage::new(u.prompt_tokens, u.completion_tokens));

        Ok(CompletionResponse {
            message,
            usage: usage.unwrap_or_default(),
            model: response.model,
            finish_reason,
        })
    }

    fn parse_responses_response(&self, response: Value) -> Result<CompletionResponse, Error> {
        let output = response
            .get("output")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::api(500, "No output in response"))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for item in output {
            match item.get("type").and_then(Value::as_str) {
                Some("message") => {
                    let parts = item.get("content").and_then(Value::as_array);
                    for part in parts.into_iter().flatten() {
                        if part.get("type").and_then(Value::as_str) == Some("output_text") {
                            text.push_str(part.get("text").and_then(Value::as_str).unwrap_or_default());
                        }
                    }
                }
                Some("function_call") => {
                    let field = |name: &str| {
                        item.get(name)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string()
                    };
                    tool_calls.push(ToolCall::new(field("call_id"), field("name"), field("arguments")));
                }
                _ => {}
            }
        }

        let (message, finish_reason) = if tool_calls.is_empty() {
            (Message::assistant(text), FinishReason::Stop)
        } else {
            let content = Some(text).filter(|t| !t.is_empty());
            (
                Message::assistant_with_tool_calls(content, &tool_calls),
                FinishReason::ToolCalls,
            )
        };

        let usage = response
            .get("usage")
            .map(|u| {
                let count = |key: &str| u.get(key).and_then(Value::as_u64).unwrap_or(0) as u32;
                Usage::new(count("input_tokens"), count("output_tokens"))
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            message,
            usage,
            model: response
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            finish_reason,
        })
    }

    async fn send(&self, request: &CompletionRequest) -> Result<reqwest::Response, Error> {
        let body = self.body(request)?;
        debug!(endpoint = %self.endpoint(), stream = request.stream, "OpenAI request");

        let mut builder = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&body);
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        if request.stream {
            // Request SSE and disable compression to prevent buffering
            builder = builder
                .header("Accept", "text/event-stream")
                .header("Accept-Encoding", "identity")
                .header("Cache-Control", "no-cache");
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(parse_error(status.as_u16(), &error_text));
        }
        Ok(response)
    }
}

#[async_trait]
impl relay_core::Provider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let mut req = request;
        req.stream = false;

        let response = self.send(&req).await?;
        match self.api {
            OpenAIApi::ChatCompletions => {
                let api_response: OpenAIChatResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::serialization(e.to_string()))?;
                self.parse_chat_response(api_response)
            }
            OpenAIApi::Responses => {
                let api_response: Value = response
                    .json()
                    .await
                    .map_err(|e| Error::serialization(e.to_string()))?;
                self.parse_responses_response(api_response)
            }
        }
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ByteStream, Error> {
        let mut req = request;
        req.stream = true;

        let response = self.send(&req).await?;
        debug!(
            status = %response.status(),
            content_type = ?response.headers().get("content-type"),
            "OpenAI stream opened"
        );

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| Error::stream(e.to_string()))
        });
        Ok(Box::pin(stream))
    }
}

fn parse_error(status: u16, body: &str) -> Error {
    #[derive(Deserialize)]
    struct ErrorResponse {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => Error::from_status(status, err.error.message),
        Err(_) => Error::from_status(status, body),
    }
}

fn chat_message(item: &ConversationItem) -> OpenAIMessage {
    match item {
        ConversationItem::Message(message) => OpenAIMessage {
            role: message.role.to_string(),
            content: message.content.clone(),
            name: message.name.clone(),
            tool_calls: if message.tool_calls.is_empty() {
                None
            } else {
                Some(
                    message
                        .tool_calls
                        .iter()
                        .map(|tc| OpenAIToolCall {
                            id: tc.id.clone(),
                            r#type: "function".to_string(),
                            function: OpenAIFunctionCall {
                                name: tc.function.name.clone(),
                                arguments: tc.function.arguments.clone(),
                            },
                        })
                        .collect(),
                )
            },
            tool_call_id: message.tool_call_id.clone(),
        },
        ConversationItem::Item(ResponseItem::FunctionCall {
            call_id,
            name,
            arguments,
        }) => OpenAIMessage {
            role: Role::Assistant.to_string(),
            content: None,
            name: None,
            tool_calls: Some(vec![OpenAIToolCall {
                id: call_id.clone(),
                r#type: "function".to_string(),
                function: OpenAIFunctionCall {
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            }]),
            tool_call_id: None,
        },
        ConversationItem::Item(ResponseItem::FunctionCallOutput { call_id, output }) => {
            OpenAIMessage {
                role: Role::Tool.to_string(),
                content: Some(output.clone()),
                name: None,
                tool_calls: None,
                tool_call_id: Some(call_id.clone()),
            }
        }
    }
}

/// Input items for the responses endpoint. Chat-shaped tool round-trips are
/// rewritten into `function_call` / `function_call_output` items.
fn responses_input(item: &ConversationItem) -> Vec<Value> {
    match item {
        ConversationItem::Item(item) => vec![serde_json::to_value(item).unwrap_or(Value::Null)],
        ConversationItem::Message(message) if message.role == Role::Tool => vec![json!({
            "type": "function_call_output",
            "call_id": message.tool_call_id.clone().unwrap_or_default(),
            "output": message.text(),
        })],
        ConversationItem::Message(message) => {
            let mut items = Vec::new();
            if !message.text().is_empty() || message.tool_calls.is_empty() {
                items.push(json!({ "role": message.role.to_string(), "content": message.text() }));
            }
            items.extend(message.tool_calls.iter().map(|tc| {
                json!({
                    "type": "function_call",
                    "call_id": tc.id,
                    "name": tc.function.name,
                    "arguments": tc.function.arguments,
                })
            }));
            items
        }
    }
}

fn chat_tool(tool: &ToolDefinition) -> OpenAITool {
    OpenAITool {
        r#type: "function".to_string(),
        function: OpenAIFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: serde_json::to_value(&tool.parameters).unwrap_or_default(),
        },
    }
}

fn responses_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    /// Model to use. Optional for servers that have a default model.
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    /// Extra parameters (reasoning_effort, chat_template_kwargs, etc.)
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct OpenAIResponsesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    input: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    r#type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    r#type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    #[serde(default)]
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
