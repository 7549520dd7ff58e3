//! relay-core: Core types and traits for relay
//!
//! This crate provides the conversation model, the provider and tool
//! abstractions, the stream plumbing shared by every wire format, and the
//! agent loop that ties them together.

pub mod agent_loop;
pub mod compression;
pub mod error;
pub mod message;
pub mod output;
pub mod provider;
pub mod stream;
pub mod tokens;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent_loop::{
    error_notice, iteration_limit_notice, AgentLoop, AgentLoopConfig, AgentProgressEvent,
    AgentProgressHandler, LoopOutcome,
};
pub use compression::{CompressionOutcome, ContextCompressor};
pub use error::Error;
pub use message::{
    last_user_text, ConversationItem, FunctionCall, Message, MessageToolCall, ResponseItem, Role,
    ToolCall, Usage,
};
pub use output::{map_reply, with_completion, TextStream};
pub use provider::{
    ByteStream, CompletionRequest, CompletionResponse, FinishReason, Generator, Provider,
    ProviderGenerator,
};
pub use stream::{
    process_with, OutputSink, ParserResponseMap, PendingToolCall, ResponseMap, StreamParser,
    StreamProcessingResult, StreamProcessor, StreamState, ToolCallAccumulator, Utf8Decoder,
};
pub use tokens::{estimate_tokens, should_compress};
pub use tool::{
    execute_tool_call, PropertySchema, Tool, ToolDefinition, ToolExecutionResult, ToolParameters,
    ToolRegistry,
};

pub type Result<T> = std::result::Result<T, Error>;
