//! Tool calling for backends that only produce free text.
//!
//! The tool catalog is written into the prompt together with an instruction
//! to answer with a fenced block holding `{"name": .., "arguments": {..}}`.
//! The model's text stream is then scanned for that block: surrounding text
//! passes through, the block becomes a tool call, and everything is re-encoded
//! as chat delta chunks so [`ChatDeltaProcessor`](crate::ChatDeltaProcessor)
//! can drive the agent loop unchanged.

use std::collections::VecDeque;
use std::sync::LazyLock;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, trace};
use uuid::Uuid;

use relay_core::{
    map_reply, ByteStream, ConversationItem, Error, Generator, Message, MessageToolCall,
    ResponseItem, Role, StreamProcessor, ToolCall, ToolDefinition, Utf8Decoder,
};

use crate::chat_delta::{encode_content, encode_delta, tool_call_delta, ChatDeltaProcessor};

static OPEN_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:function|json)?").expect("valid fence pattern"));

const CLOSE_FENCE: &str = "\n```";

const TOOL_INSTRUCTIONS: &str = r#"When one of these tools is needed, first say in plain language what you are going to do. Then, as the very last part of your answer, write exactly one fenced block that opens with ```function or ```json and contains a single JSON object:

```function
{"name": "<tool name>", "arguments": {<arguments matching the tool's parameters>}}
```

Write nothing after the block. Do not use the block format for anything other than calling a tool."#;

/// Prompt block listing every tool with its parameter schema.
pub fn render_tool_catalog(tools: &[ToolDefinition]) -> String {
    let mut out = String::from("You can use the following tools:\n\n");
    for tool in tools {
        let schema = serde_json::to_string(&tool.parameters).unwrap_or_else(|_| "{}".to_string());
        out.push_str(&format!(
            "### {}\n{}\nParameters (JSON Schema): {}\n\n",
            tool.name, tool.description, schema
        ));
    }
    out.push_str(TOOL_INSTRUCTIONS);
    out
}

/// The fenced text a model is asked to produce for one call.
pub fn render_call_block(name: &str, arguments: &str) -> String {
    let arguments: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
    format!(
        "```function\n{{\"name\":{},\"arguments\":{}}}\n```",
        Value::String(name.to_string()),
        arguments
    )
}

fn render_tool_result(call_id: &str, result: &str) -> String {
    format!(
        "This was the result of tool call `{}`:\n```json\n{}\n```\n",
        call_id, result
    )
}

fn render_call_turn(text: &str, calls: &[MessageToolCall]) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !text.is_empty() {
        parts.push(text.to_string());
    }
    parts.extend(
        calls
            .iter()
            .map(|tc| render_call_block(&tc.function.name, &tc.function.arguments)),
    );
    parts.join("\n")
}

/// Rewrite `conversation` so a text-only backend can follow it.
///
/// Native tool round-trips become plain assistant text and the tool catalog is
/// appended to the latest user turn.
pub fn augment_conversation(
    conversation: &[ConversationItem],
    tools: &[ToolDefinition],
) -> Vec<ConversationItem> {
    let mut augmented: Vec<ConversationItem> = conversation
        .iter()
        .map(|item| match item {
            ConversationItem::Message(msg) if msg.role == Role::Tool => Message::assistant(
                render_tool_result(msg.tool_call_id.as_deref().unwrap_or_default(), msg.text()),
            )
            .into(),
            ConversationItem::Message(msg)
                if msg.role == Role::Assistant && !msg.tool_calls.is_empty() =>
            {
                Message::assistant(render_call_turn(msg.text(), &msg.tool_calls)).into()
            }
            ConversationItem::Item(ResponseItem::FunctionCall {
                name, arguments, ..
            }) => Message::assistant(render_call_block(name, arguments)).into(),
            ConversationItem::Item(ResponseItem::FunctionCallOutput { call_id, output }) => {
                Message::assistant(render_tool_result(call_id, output)).into()
            }
            other => other.clone(),
        })
        .collect();

    if tools.is_empty() {
        return augmented;
    }

    let catalog = render_tool_catalog(tools);
    let last_user = augmented
        .iter_mut()
        .rev()
        .filter_map(|item| match item {
            ConversationItem::Message(msg) if msg.role == Role::User => Some(msg),
            _ => None,
        })
        .next();

    match last_user {
        Some(msg) => {
            let content = match msg.content.take() {
                Some(text) if !text.is_empty() => format!("{}\n\n{}", text, catalog),
                _ => catalog,
            };
            msg.content = Some(content);
        }
        None => augmented.push(Message::user(catalog).into()),
    }
    augmented
}

/// What the fence extractor found in the text stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    Text(String),
    ToolCall(ToolCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FenceState {
    #[default]
    Outside,
    Inside,
}

/// Streaming state machine that pulls fenced tool-call blocks out of text.
#[derive(Debug, Default)]
pub struct FenceExtractor {
    state: FenceState,
    buffer: String,
}

impl FenceExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_inside_block(&self) -> bool {
        self.state == FenceState::Inside
    }

    pub fn feed(&mut self, text: &str) -> Vec<AdapterEvent> {
        self.buffer.push_str(text);
        let mut events = Vec::new();

        loop {
            match self.state {
                FenceState::Outside => match OPEN_FENCE.find(&self.buffer) {
                    Some(open) => {
                        let before: String = self.buffer.drain(..open.start()).collect();
                        push_text(&mut events, before);
                        self.state = FenceState::Inside;
                    }
                    None => {
                        // a trailing run of backticks may still become a fence
                        let keep = self.buffer.len() - self.buffer.trim_end_matches('`').len();
                        let safe = self.buffer.len() - keep;
                        let text: String = self.buffer.drain(..safe).collect();
                        push_text(&mut events, text);
                        return events;
                    }
                },
                FenceState::Inside => {
                    let Some(close) = self.buffer[3..].find(CLOSE_FENCE) else {
                        return events;
                    };
                    let end = 3 + close + CLOSE_FENCE.len();
                    let block: String = self.buffer.drain(..end).collect();
                    events.push(parse_block(block));
                    self.state = FenceState::Outside;
                }
            }
        }
    }

    /// Flush at end of stream. An unterminated block is parsed as-is.
    pub fn finish(&mut self) -> Vec<AdapterEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        match self.state {
            FenceState::Outside => push_text(&mut events, rest),
            FenceState::Inside => {
                debug!("Stream ended inside a fenced block");
                events.push(parse_block(rest));
            }
        }
        self.state = FenceState::Outside;
        events
    }
}

fn push_text(events: &mut Vec<AdapterEvent>, text: String) {
    if !text.is_empty() {
        events.push(AdapterEvent::Text(text));
    }
}

/// A block becomes a call when its payload is `{name: string, arguments: object}`;
/// anything else is handed back as text.
fn parse_block(block: String) -> AdapterEvent {
    match parse_call(&block) {
        Some(call) => {
            debug!(tool = %call.name, id = %call.id, "Extracted fenced tool call");
            AdapterEvent::ToolCall(call)
        }
        None => {
            trace!("Fenced block is not a tool call");
            AdapterEvent::Text(block)
        }
    }
}

fn parse_call(block: &str) -> Option<ToolCall> {
    let open = OPEN_FENCE.find(block)?;
    let body = block[open.end()..].trim_end();
    let body = body.trim_end_matches('`').trim();

    let payload: Value = serde_json::from_str(body).ok()?;
    let name = payload.get("name")?.as_str().filter(|n| !n.is_empty())?;
    let arguments = payload.get("arguments").filter(|a| a.is_object())?;

    Some(ToolCall::new(
        format!("call_{}", Uuid::new_v4().simple()),
        name,
        arguments.to_string(),
    ))
}

struct AdapterState {
    inner: ByteStream,
    decoder: Utf8Decoder,
    extractor: FenceExtractor,
    queue: VecDeque<Vec<u8>>,
    calls: usize,
    finished: bool,
}

impl AdapterState {
    fn enqueue(&mut self, events: Vec<AdapterEvent>) {
        for event in events {
            match event {
                AdapterEvent::Text(text) => self.queue.push_back(encode_content(&text)),
                AdapterEvent::ToolCall(call) => {
                    let delta = json!({ "tool_calls": [tool_call_delta(self.calls, &call)] });
                    self.queue.push_back(encode_delta(delta, Some("tool_calls")));
                    self.calls += 1;
                }
            }
        }
    }
}

/// Turns a free-text stream into chat delta chunks.
pub struct TextToolAdapter;

impl TextToolAdapter {
    /// Re-encode `stream` as newline-delimited delta chunks. When no call is
    /// found, the stream closes with an empty `stop` chunk.
    pub fn adapt(stream: ByteStream) -> ByteStream {
        let state = AdapterState {
            inner: stream,
            decoder: Utf8Decoder::new(),
            extractor: FenceExtractor::new(),
            queue: VecDeque::new(),
            calls: 0,
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(chunk) = state.queue.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.finished {
                    return None;
                }
                match state.inner.next().await {
                    Some(Ok(bytes)) => {
                        let text = state.decoder.decode(&bytes);
                        let events = state.extractor.feed(&text);
                        state.enqueue(events);
                    }
                    Some(Err(e)) => return Some((Err(e), state)),
                    None => {
                        let tail = state.decoder.finish();
                        let mut events = state.extractor.feed(&tail);
                        events.extend(state.extractor.finish());
                        state.enqueue(events);
                        if state.calls == 0 {
                            state
                                .queue
                                .push_back(encode_delta(json!({ "content": "" }), Some("stop")));
                        }
                        state.finished = true;
                    }
                }
            }
        });

        Box::pin(stream)
    }
}

/// Emulates tool calling on top of a text-only [`Generator`].
///
/// Each call augments the conversation with the catalog, asks `inner` for
/// text and adapts the result, so it pairs with [`ChatDeltaProcessor`].
pub struct TextToolGenerator<G> {
    inner: G,
    tools: Vec<ToolDefinition>,
}

impl<G: Generator> TextToolGenerator<G> {
    pub fn new(inner: G, tools: Vec<ToolDefinition>) -> Self {
        Self { inner, tools }
    }
}

#[async_trait]
impl<G: Generator> Generator for TextToolGenerator<G> {
    async fn generate(&self, conversation: &[ConversationItem]) -> Result<ByteStream, Error> {
        let augmented = augment_conversation(conversation, &self.tools);
        let text = self.inner.generate(&augmented).await?;
        Ok(TextToolAdapter::adapt(text))
    }
}

/// Reduces a chat-delta generator to the bare text it streams, for backends
/// whose tool support is not used.
pub struct PlainTextGenerator<G> {
    inner: G,
}

impl<G: Generator> PlainTextGenerator<G> {
    pub fn new(inner: G) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<G: Generator> Generator for PlainTextGenerator<G> {
    async fn generate(&self, conversation: &[ConversationItem]) -> Result<ByteStream, Error> {
        let stream = self.inner.generate(conversation).await?;
        let text = map_reply(stream, ChatDeltaProcessor::new().response_map());
        Ok(Box::pin(text.map(|chunk| chunk.map(String::into_bytes))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::testing::{byte_stream, collect_stream, split_stream, MockGenerator};
    use relay_core::{OutputSink, PropertySchema, StreamProcessingResult, ToolParameters};

    const ROUND_TRIP: &str =
        "Will search.\n```function\n{\"name\":\"search\",\"arguments\":{\"q\":\"x\"}}\n```";

    fn extract(text: &str, size: usize) -> Vec<AdapterEvent> {
        let mut extractor = FenceExtractor::new();
        let mut events = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        for piece in chars.chunks(size) {
            events.extend(extractor.feed(&piece.iter().collect::<String>()));
        }
        events.extend(extractor.finish());
        events
    }

    fn text_of(events: &[AdapterEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                AdapterEvent::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    fn calls_of(events: &[AdapterEvent]) -> Vec<&ToolCall> {
        events
            .iter()
            .filter_map(|e| match e {
                AdapterEvent::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn search_tool() -> ToolDefinition {
        ToolDefinition::new("search", "Search the web").with_parameters(
            ToolParameters::new().add_property("q", PropertySchema::string("Query"), true),
        )
    }

    #[test]
    fn test_round_trip_at_every_split() {
        for size in 1..=ROUND_TRIP.len() {
            let events = extract(ROUND_TRIP, size);
            assert_eq!(text_of(&events), "Will search.\n", "split size {}", size);
            let calls = calls_of(&events);
            assert_eq!(calls.len(), 1, "split size {}", size);
            assert_eq!(calls[0].name, "search");
            assert_eq!(calls[0].arguments, r#"{"q":"x"}"#);
            assert!(calls[0].id.starts_with("call_"));
        }
    }

    #[test]
    fn test_plain_text_passes_through() {
        let text = "Sem ferramentas aqui, só `código` inline.";
        let events = extract(text, 3);
        assert_eq!(text_of(&events), text);
        assert!(calls_of(&events).is_empty());
    }

    #[test]
    fn test_withholds_possible_fence_start() {
        let mut extractor = FenceExtractor::new();
        assert_eq!(
            extractor.feed("abc``"),
            vec![AdapterEvent::Text("abc".to_string())]
        );
        assert!(extractor.feed("`").is_empty());
        assert!(extractor.is_inside_block());
    }

    #[test]
    fn test_invalid_block_is_reemitted_as_text() {
        let text = "Exemplo:\n```json\n[1, 2, 3]\n```\nfim";
        for size in [1, 4, text.len()] {
            let events = extract(text, size);
            assert_eq!(text_of(&events), text);
            assert!(calls_of(&events).is_empty());
        }

        let null_args = "```function\n{\"name\":\"t\",\"arguments\":null}\n```";
        assert!(calls_of(&extract(null_args, 2)).is_empty());
    }

    #[test]
    fn test_unterminated_block_is_parsed_at_end() {
        let text = "ok\n```function\n{\"name\":\"t\",\"arguments\":{}}\n``";
        let events = extract(text, 5);
        assert_eq!(text_of(&events), "ok\n");
        assert_eq!(calls_of(&events).len(), 1);
        assert_eq!(calls_of(&events)[0].arguments, "{}");
    }

    #[test]
    fn test_augment_rewrites_tool_turns_and_appends_catalog() {
        let call = ToolCall::new("call_1", "search", r#"{"q":"x"}"#);
        let conversation: Vec<ConversationItem> = vec![
            Message::system("be brief").into(),
            Message::user("first").into(),
            Message::user("find x").into(),
            Message::assistant_with_tool_calls(Some("Vou buscar.".to_string()), &[call]).into(),
            Message::tool_result("call_1", r#"{"hits":1}"#).into(),
        ];

        let augmented = augment_conversation(&conversation, &[search_tool()]);
        assert_eq!(augmented.len(), 5);
        assert_eq!(augmented[1], conversation[1]);

        let user = augmented[2].as_message().unwrap();
        assert!(user.text().starts_with("find x\n\n"));
        assert!(user.text().contains("### search"));
        assert!(user.text().contains("```function"));

        let assistant = augmented[3].as_message().unwrap();
        assert!(assistant.tool_calls.is_empty());
        assert_eq!(
            assistant.text(),
            "Vou buscar.\n```function\n{\"name\":\"search\",\"arguments\":{\"q\":\"x\"}}\n```"
        );

        let result = augmented[4].as_message().unwrap();
        assert_eq!(result.role, Role::Assistant);
        assert_eq!(
            result.text(),
            "This was the result of tool call `call_1`:\n```json\n{\"hits\":1}\n```\n"
        );
    }

    #[test]
    fn test_catalog_names_both_openers() {
        let catalog = render_tool_catalog(&[search_tool()]);
        assert!(catalog.contains("opens with ```function or ```json"));
        assert!(catalog.contains("Parameters (JSON Schema): "));
    }

    #[test]
    fn test_augment_without_user_turn_adds_one() {
        let conversation: Vec<ConversationItem> = vec![Message::system("sys").into()];
        let augmented = augment_conversation(&conversation, &[search_tool()]);
        assert_eq!(augmented.len(), 2);
        assert_eq!(augmented[1].role(), Some(Role::User));

        // no catalog when there is nothing to call
        assert_eq!(augment_conversation(&conversation, &[]), conversation);
    }

    async fn process(reader: ByteStream) -> StreamProcessingResult {
        let (sink, _output) = OutputSink::channel(4096);
        ChatDeltaProcessor::new()
            .process_stream(reader, &sink)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_adapted_stream_drives_chat_processor() {
        let result = process(TextToolAdapter::adapt(split_stream(ROUND_TRIP, 1))).await;
        assert_eq!(result.raw_content, "Will search.\n");
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].name, "search");
        assert_eq!(result.tool_calls[0].arguments, r#"{"q":"x"}"#);
    }

    #[tokio::test]
    async fn test_adapted_stream_without_call_ends_with_stop() {
        let output = collect_stream(TextToolAdapter::adapt(byte_stream(["Olá!"]))).await;
        let last = output.lines().last().unwrap();
        let chunk: Value = serde_json::from_str(last).unwrap();
        assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "");

        let result = process(TextToolAdapter::adapt(byte_stream(["Olá!"]))).await;
        assert_eq!(result.raw_content, "Olá!");
        assert!(result.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_generator_augments_and_adapts() {
        let inner = MockGenerator::new();
        inner.queue([ROUND_TRIP]);
        let generator = TextToolGenerator::new(inner, vec![search_tool()]);

        let conversation: Vec<ConversationItem> = vec![Message::user("find x").into()];
        let stream = generator.generate(&conversation).await.unwrap();
        let result = process(stream).await;
        assert_eq!(result.tool_calls.len(), 1);

        let sent = generator.inner.last_conversation().unwrap();
        assert!(sent[0].as_message().unwrap().text().contains("### search"));
    }

    #[tokio::test]
    async fn test_plain_text_generator_strips_delta_framing() {
        let inner = MockGenerator::new();
        inner.queue([
            "data: {\"choices\":[{\"delta\":{\"content\":\"Olá, \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"mundo\"}}]}\n\ndata: [DONE]\n\n",
        ]);
        let generator = PlainTextGenerator::new(inner);
        let stream = generator.generate(&[]).await.unwrap();
        assert_eq!(collect_stream(stream).await, "Olá, mundo");
    }
}
