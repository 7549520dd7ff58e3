//! Stream processor for chat-completion delta chunks.
//!
//! Each unit of the stream is a JSON object shaped
//! `{"choices":[{"delta":{"content":..,"tool_calls":[..]}}]}`. Objects may
//! arrive concatenated, newline-delimited, or inside SSE `data:` lines, and may
//! be split across chunks anywhere; incomplete input is buffered until it can
//! be parsed.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::trace;

use relay_core::{
    process_with, ByteStream, ConversationItem, Error, Message, OutputSink, ParserResponseMap,
    PendingToolCall, ResponseMap, StreamParser, StreamProcessingResult, StreamProcessor,
    StreamState, ToolCall, ToolExecutionResult,
};

/// Render one delta chunk as a newline-terminated JSON object.
pub fn encode_delta(delta: Value, finish_reason: Option<&str>) -> Vec<u8> {
    let chunk = json!({
        "object": "chat.completion.chunk",
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }]
    });
    let mut bytes = chunk.to_string().into_bytes();
    bytes.push(b'\n');
    bytes
}

/// Delta chunk carrying plain assistant text.
pub fn encode_content(text: &str) -> Vec<u8> {
    encode_delta(json!({ "content": text }), None)
}

/// One complete entry of `delta.tool_calls`.
pub fn tool_call_delta(index: usize, call: &ToolCall) -> Value {
    json!({
        "index": index,
        "id": call.id,
        "type": "function",
        "function": { "name": call.name, "arguments": call.arguments },
    })
}

/// Delta chunk carrying complete tool calls, closing the turn.
pub fn encode_tool_calls(calls: &[ToolCall]) -> Vec<u8> {
    let tool_calls: Vec<Value> = calls
        .iter()
        .enumerate()
        .map(|(index, call)| tool_call_delta(index, call))
        .collect();
    encode_delta(json!({ "tool_calls": tool_calls }), Some("tool_calls"))
}

/// Incremental parser for delta chunks.
#[derive(Debug, Default)]
pub struct ChatDeltaParser {
    buffer: String,
    /// Offsets in `buffer` where a later fed chunk begins, ascending.
    chunk_starts: Vec<usize>,
}

impl ChatDeltaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the first `n` bytes of the buffer, keeping chunk offsets aligned.
    fn consume(&mut self, n: usize) {
        self.buffer.drain(..n);
        self.chunk_starts.retain_mut(|start| {
            if *start > n {
                *start -= n;
                true
            } else {
                false
            }
        });
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.chunk_starts.clear();
    }

    /// Consume as many complete units from the buffer as possible.
    fn drain(&mut self, state: &mut StreamState, at_end: bool) {
        loop {
            let start = self.buffer.len() - self.buffer.trim_start().len();
            if start > 0 {
                self.consume(start);
            }
            if self.buffer.is_empty() {
                return;
            }

            if self.buffer.starts_with('{') {
                let parsed = {
                    let mut objects =
                        serde_json::Deserializer::from_str(&self.buffer).into_iter::<Value>();
                    match objects.next() {
                        Some(Ok(value)) => Ok((value, objects.byte_offset())),
                        Some(Err(e)) => Err(e.is_eof()),
                        None => Err(true),
                    }
                };
                match parsed {
                    Ok((value, consumed)) => {
                        apply_chunk(&value, state);
                        self.consume(consumed);
                        continue;
                    }
                    Err(incomplete) if incomplete && !at_end => return,
                    Err(_) => {
                        trace!("Dropping malformed delta chunk");
                        self.resync(at_end);
                        continue;
                    }
                }
            }

            let line = match self.buffer.find('\n') {
                Some(end) => {
                    let line = self.buffer[..=end].to_string();
                    self.consume(end + 1);
                    line
                }
                None if at_end => {
                    let line = std::mem::take(&mut self.buffer);
                    self.chunk_starts.clear();
                    line
                }
                None => return,
            };
            self.apply_line(line.trim(), state);
        }
    }

    /// Skip past a broken object: through the next newline when there is one,
    /// otherwise to the next chunk that opens a fresh object.
    fn resync(&mut self, at_end: bool) {
        if let Some(end) = self.buffer.find('\n') {
            self.consume(end + 1);
            return;
        }
        let next = self
            .chunk_starts
            .iter()
            .copied()
            .find(|&start| self.buffer[start..].trim_start().starts_with('{'));
        match next {
            Some(start) => self.consume(start),
            // the broken object spans everything buffered
            None => {
                if !at_end {
                    trace!(dropped = self.buffer.len(), "Discarding unframed broken chunk");
                }
                self.clear();
            }
        }
    }

    fn apply_line(&self, line: &str, state: &mut StreamState) {
        // event:, id:, retry: and comment lines carry nothing for this format
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => apply_chunk(&value, state),
            Err(_) => trace!("Dropping malformed data line"),
        }
    }
}

fn apply_chunk(chunk: &Value, state: &mut StreamState) {
    let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
        return;
    };

    for choice in choices {
        let Some(delta) = choice.get("delta") else {
            continue;
        };

        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            state.push_text(content);
        }

        let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) else {
            continue;
        };
        for (position, tc) in tool_calls.iter().enumerate() {
            let index = tc
                .get("index")
                .and_then(Value::as_u64)
                .unwrap_or(position as u64);
            let function = tc.get("function");
            state.pending.merge(
                index,
                tc.get("id").and_then(Value::as_str),
                function.and_then(|f| f.get("name")).and_then(Value::as_str),
                function
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str),
            );
        }
    }
}

impl StreamParser for ChatDeltaParser {
    fn feed(&mut self, text: &str, state: &mut StreamState) {
        if !self.buffer.is_empty() && !text.is_empty() {
            self.chunk_starts.push(self.buffer.len());
        }
        self.buffer.push_str(text);
        self.drain(state, false);
    }

    fn finish(&mut self, state: &mut StreamState) {
        self.drain(state, true);

        let slots: Vec<(u64, PendingToolCall)> = state.pending.drain().collect();
        for (index, mut call) in slots {
            if call.name.is_empty() {
                continue;
            }
            if call.id.is_empty() {
                call.id = format!("call_{}", index);
            }
            state.complete(call);
        }
    }
}

/// Variant A: chat-completion delta chunks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChatDeltaProcessor;

impl ChatDeltaProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StreamProcessor for ChatDeltaProcessor {
    fn name(&self) -> &str {
        "chat"
    }

    async fn process_stream(
        &self,
        reader: ByteStream,
        sink: &OutputSink,
    ) -> Result<StreamProcessingResult, Error> {
        process_with(ChatDeltaParser::new(), reader, sink).await
    }

    /// One assistant message carrying every call, then one tool message per
    /// result, in call order.
    fn format_tool_results_for_next_call(
        &self,
        results: &[ToolExecutionResult],
    ) -> Vec<ConversationItem> {
        if results.is_empty() {
            return Vec::new();
        }
        let calls: Vec<ToolCall> = results.iter().map(ToolExecutionResult::tool_call).collect();

        let mut items = Vec::with_capacity(results.len() + 1);
        items.push(Message::assistant_with_tool_calls(None, &calls).into());
        items.extend(
            results
                .iter()
                .map(|r| Message::tool_result(&r.tool_call_id, r.result_json()).into()),
        );
        items
    }

    fn encode_text(&self, text: &str) -> Vec<u8> {
        encode_content(text)
    }

    fn response_map(&self) -> Box<dyn ResponseMap> {
        Box::new(ParserResponseMap::new(ChatDeltaParser::new()))
    }
}
