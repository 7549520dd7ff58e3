//! Stream processor for the typed-event responses protocol.
//!
//! The stream is SSE: `event:` lines name the event, `data:` lines carry its
//! JSON payload. Tool calls open with `response.output_item.added`, grow with
//! `response.function_call_arguments.delta` and are only reported once
//! `response.function_call_arguments.done` arrives.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::trace;

use relay_core::{
    process_with, ByteStream, ConversationItem, Error, OutputSink, ParserResponseMap,
    ResponseItem, ResponseMap, StreamParser, StreamProcessingResult, StreamProcessor, StreamState,
    ToolExecutionResult,
};

pub const OUTPUT_ITEM_ADDED: &str = "response.output_item.added";
pub const ARGUMENTS_DELTA: &str = "response.function_call_arguments.delta";
pub const ARGUMENTS_DONE: &str = "response.function_call_arguments.done";
pub const OUTPUT_TEXT_DELTA: &str = "response.output_text.delta";

/// Render one SSE event.
pub fn encode_event(event: &str, payload: &Value) -> Vec<u8> {
    format!("event: {}\ndata: {}\n\n", event, payload).into_bytes()
}

/// Incremental SSE parser for responses events.
#[derive(Debug, Default)]
pub struct ResponsesParser {
    line: String,
    event: Option<String>,
}

impl ResponsesParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_line(&mut self, line: &str, state: &mut StreamState) {
        let line = line.trim_end_matches('\r');

        if line.is_empty() {
            self.event = None;
            return;
        }
        if let Some(event) = line.strip_prefix("event:") {
            self.event = Some(event.trim().to_string());
            return;
        }
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            return;
        }

        let data: Value = match serde_json::from_str(payload) {
            Ok(data) => data,
            Err(_) => {
                trace!("Dropping malformed SSE data line");
                return;
            }
        };

        let event = match self.event.take() {
            Some(event) => event,
            None => match data.get("type").and_then(Value::as_str) {
                Some(kind) => kind.to_string(),
                None => return,
            },
        };
        apply_event(&event, &data, state);
    }
}

fn output_index(data: &Value) -> u64 {
    data.get("output_index").and_then(Value::as_u64).unwrap_or(0)
}

fn apply_event(event: &str, data: &Value, state: &mut StreamState) {
    match event {
        OUTPUT_TEXT_DELTA => {
            if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                state.push_text(delta);
            }
        }
        OUTPUT_ITEM_ADDED => {
            let Some(item) = data.get("item") else {
                return;
            };
            if item.get("type").and_then(Value::as_str) != Some("function_call") {
                return;
            }
            let slot = state.pending.slot(output_index(data));
            if let Some(id) = item.get("call_id").and_then(Value::as_str) {
                slot.id = id.to_string();
            }
            if let Some(name) = item.get("name").and_then(Value::as_str) {
                slot.name = name.to_string();
            }
            if let Some(arguments) = item.get("arguments").and_then(Value::as_str) {
                slot.arguments = arguments.to_string();
            }
        }
        ARGUMENTS_DELTA => {
            let index = output_index(data);
            if !state.pending.contains(index) {
                return;
            }
            if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                state.pending.merge(index, None, None, Some(delta));
            }
        }
        ARGUMENTS_DONE => {
            let Some(mut call) = state.pending.remove(output_index(data)) else {
                return;
            };
            if let Some(arguments) = data.get("arguments").and_then(Value::as_str) {
                call.arguments = arguments.to_string();
            }
            state.complete(call);
        }
        _ => {}
    }
}

impl StreamParser for ResponsesParser {
    fn feed(&mut self, text: &str, state: &mut StreamState) {
        self.line.push_str(text);
        while let Some(end) = self.line.find('\n') {
            let line: String = self.line.drain(..=end).collect();
            self.handle_line(&line[..line.len() - 1], state);
        }
    }

    fn finish(&mut self, state: &mut StreamState) {
        let rest = std::mem::take(&mut self.line);
        if !rest.is_empty() {
            self.handle_line(&rest, state);
        }
        // calls still pending never saw arguments.done and are not reported
    }
}

/// Variant B: typed SSE events.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponsesProcessor;

impl ResponsesProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StreamProcessor for ResponsesProcessor {
    fn name(&self) -> &str {
        "responses"
    }

    async fn process_stream(
        &self,
        reader: ByteStream,
        sink: &OutputSink,
    ) -> Result<StreamProcessingResult, Error> {
        process_with(ResponsesParser::new(), reader, sink).await
    }

    /// A `function_call` item echoing each call, immediately followed by its
    /// `function_call_output`.
    fn format_tool_results_for_next_call(
        &self,
        results: &[ToolExecutionResult],
    ) -> Vec<ConversationItem> {
        results
            .iter()
            .flat_map(|r| {
                [
                    ResponseItem::FunctionCall {
                        call_id: r.tool_call_id.clone(),
                        name: r.tool_name.clone(),
                        arguments: r.arguments.clone(),
                    }
                    .into(),
                    ResponseItem::FunctionCallOutput {
                        call_id: r.tool_call_id.clone(),
                        output: r.result_json(),
                    }
                    .into(),
                ]
            })
            .collect()
    }

    fn encode_text(&self, text: &str) -> Vec<u8> {
        encode_event(
            OUTPUT_TEXT_DELTA,
            &json!({ "type": OUTPUT_TEXT_DELTA, "delta": text }),
        )
    }

    fn response_map(&self) -> Box<dyn ResponseMap> {
        Box::new(ParserResponseMap::new(ResponsesParser::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::testing::{byte_stream, collect_stream, split_stream};
    use relay_core::ToolCall;

    async fn process(reader: ByteStream) -> StreamProcessingResult {
        let (sink, _output) = OutputSink::channel(8192);
        ResponsesProcessor::new()
            .process_stream(reader, &sink)
            .await
            .unwrap()
    }

    fn sample() -> String {
        let events = [
            (
                "response.created",
                json!({"type": "response.created", "response": {"id": "resp_1"}}),
            ),
            (
                OUTPUT_TEXT_DELTA,
                json!({"type": OUTPUT_TEXT_DELTA, "output_index": 0, "delta": "Buscando "}),
            ),
            (
                OUTPUT_TEXT_DELTA,
                json!({"type": OUTPUT_TEXT_DELTA, "output_index": 0, "delta": "preços…"}),
            ),
            (
                OUTPUT_ITEM_ADDED,
                json!({"type": OUTPUT_ITEM_ADDED, "output_index": 1, "item": {
                    "type": "function_call", "id": "fc_1", "call_id": "call_1",
                    "name": "web_search", "arguments": ""
                }}),
            ),
            (
                ARGUMENTS_DELTA,
                json!({"type": ARGUMENTS_DELTA, "output_index": 1, "delta": "{\"query\":"}),
            ),
            (
                ARGUMENTS_DELTA,
                json!({"type": ARGUMENTS_DELTA, "output_index": 1, "delta": "\"café\"}"}),
            ),
            (
                ARGUMENTS_DONE,
                json!({"type": ARGUMENTS_DONE, "output_index": 1}),
            ),
            (
                OUTPUT_ITEM_ADDED,
                json!({"type": OUTPUT_ITEM_ADDED, "output_index": 2, "item": {
                    "type": "function_call", "call_id": "call_2", "name": "fetch_webpage"
                }}),
            ),
            (
                ARGUMENTS_DELTA,
                json!({"type": ARGUMENTS_DELTA, "output_index": 2, "delta": "{\"url\":\"partial"}),
            ),
            (
                ARGUMENTS_DONE,
                json!({"type": ARGUMENTS_DONE, "output_index": 2, "arguments": "{\"url\":\"https://a.b\"}"}),
            ),
            ("response.completed", json!({"type": "response.completed"})),
        ];
        events
            .iter()
            .map(|(event, data)| String::from_utf8(encode_event(event, data)).unwrap())
            .collect()
    }

    fn expected_calls() -> Vec<ToolCall> {
        vec![
            ToolCall::new("call_1", "web_search", r#"{"query":"café"}"#),
            ToolCall::new("call_2", "fetch_webpage", r#"{"url":"https://a.b"}"#),
        ]
    }

    #[tokio::test]
    async fn test_extracts_text_and_finalized_calls() {
        let result = process(byte_stream([sample()])).await;
        assert_eq!(result.raw_content, "Buscando preços…");
        assert!(result.has_assistant_content);
        assert_eq!(result.tool_calls, expected_calls());
    }

    #[tokio::test]
    async fn test_chunk_boundary_invariance() {
        let expected = process(byte_stream([sample()])).await;
        for size in [1, 2, 5, 13, 100] {
            assert_eq!(process(split_stream(&sample(), size)).await, expected, "split size {}", size);
        }
    }

    #[tokio::test]
    async fn test_unfinalized_call_is_dropped() {
        let body = concat!(
            "event: response.output_item.added\n",
            "data: {\"output_index\":0,\"item\":{\"type\":\"function_call\",\"call_id\":\"c\",\"name\":\"t\"}}\n\n",
            "event: response.function_call_arguments.delta\n",
            "data: {\"output_index\":0,\"delta\":\"{}\"}\n\n",
        );
        let result = process(byte_stream([body])).await;
        assert!(result.tool_calls.is_empty());
        assert!(!result.has_assistant_content);
    }

    #[tokio::test]
    async fn test_type_field_used_without_event_line_and_noise_ignored() {
        let body = concat!(
            ": ping\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"a\"}\n\n",
            "event: response.output_text.delta\n",
            "data: {not json\n\n",
            "data: {\"delta\":\"orphan\"}\n\n",
            "event: response.output_text.delta\r\n",
            "data: {\"delta\":\"b\"}\r\n\r\n",
            "data: [DONE]\n\n",
        );
        let result = process(byte_stream([body])).await;
        assert_eq!(result.raw_content, "ab");
    }

    #[tokio::test]
    async fn test_passthrough_is_verbatim() {
        let (sink, output) = OutputSink::channel(8192);
        ResponsesProcessor::new()
            .process_stream(split_stream(&sample(), 7), &sink)
            .await
            .unwrap();
        drop(sink);
        assert_eq!(collect_stream(output).await, sample());
    }

    #[tokio::test]
    async fn test_formatted_results_round_trip_arguments() {
        let processor = ResponsesProcessor::new();
        let results: Vec<ToolExecutionResult> = expected_calls()
            .into_iter()
            .map(|call| ToolExecutionResult {
                tool_call_id: call.id,
                tool_name: call.name,
                arguments: call.arguments,
                result: json!({"ok": true}),
                execution_time_ms: 0,
            })
            .collect();

        let items = processor.format_tool_results_for_next_call(&results);
        assert_eq!(items.len(), 4);
        assert_eq!(
            items[1],
            ConversationItem::Item(ResponseItem::FunctionCallOutput {
                call_id: "call_1".to_string(),
                output: r#"{"ok":true}"#.to_string(),
            })
        );

        // replay the echoed calls as the backend would have streamed them
        let mut replay = String::new();
        for (index, item) in items.iter().enumerate() {
            if let ConversationItem::Item(ResponseItem::FunctionCall {
                call_id,
                name,
                arguments,
            }) = item
            {
                let added = json!({"output_index": index, "item": {
                    "type": "function_call", "call_id": call_id, "name": name
                }});
                let delta = json!({"output_index": index, "delta": arguments});
                let done = json!({"output_index": index});
                for (event, data) in [
                    (OUTPUT_ITEM_ADDED, added),
                    (ARGUMENTS_DELTA, delta),
                    (ARGUMENTS_DONE, done),
                ] {
                    replay.push_str(&String::from_utf8(encode_event(event, &data)).unwrap());
                }
            }
        }
        let replayed = process(split_stream(&replay, 3)).await;
        assert_eq!(replayed.tool_calls, expected_calls());
    }

    #[test]
    fn test_response_map_yields_visible_text() {
        let processor = ResponsesProcessor::new();
        let mut map = processor.response_map();
        let mut visible = String::new();
        for chunk in sample().as_bytes().chunks(9) {
            visible.push_str(&map.map(chunk));
        }
        visible.push_str(&map.map(&processor.encode_text("\n\nfim")));
        assert_eq!(visible, "Buscando preços…\n\nfim");
    }
}
