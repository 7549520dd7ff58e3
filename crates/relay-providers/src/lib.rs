//! relay-providers: wire formats and backends
//!
//! Stream processors for the chat-delta and responses protocols, the text
//! adapter that emulates tool calling for text-only backends, and an
//! OpenAI-compatible HTTP provider that feeds them.

pub mod chat_delta;
pub mod openai;
pub mod responses;
pub mod text_tools;

pub use chat_delta::{ChatDeltaParser, ChatDeltaProcessor};
pub use openai::{OpenAIApi, OpenAIProvider};
pub use responses::{ResponsesParser, ResponsesProcessor};
pub use text_tools::{
    augment_conversation, AdapterEvent, FenceExtractor, PlainTextGenerator, TextToolAdapter,
    TextToolGenerator,
};
