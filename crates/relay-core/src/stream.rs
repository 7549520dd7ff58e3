//! Shared plumbing for stream processors.
//!
//! A processor reads a backend's raw byte stream to exhaustion, forwards every
//! chunk to an [`OutputSink`] untouched, and parses a decoded copy into a
//! [`StreamProcessingResult`]. Wire-format specifics live behind
//! [`StreamParser`]; everything else here is format-agnostic.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::trace;

use crate::error::Error;
use crate::message::{ConversationItem, ToolCall};
use crate::provider::ByteStream;
use crate::tool::ToolExecutionResult;

/// What one pass over a backend stream produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamProcessingResult {
    /// Completed calls in stream order. Slots missing a name or id are dropped.
    pub tool_calls: Vec<ToolCall>,
    pub has_assistant_content: bool,
    pub raw_content: String,
}

/// Parses one backend's wire format.
#[async_trait]
pub trait StreamProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Read `reader` to exhaustion, forwarding every chunk to `sink` as it
    /// arrives, and return the normalized result.
    async fn process_stream(
        &self,
        reader: ByteStream,
        sink: &OutputSink,
    ) -> Result<StreamProcessingResult, Error>;

    /// Represent an iteration's tool round-trip as history entries this
    /// protocol accepts on the follow-up call.
    fn format_tool_results_for_next_call(
        &self,
        results: &[ToolExecutionResult],
    ) -> Vec<ConversationItem>;

    /// Render a user-visible text chunk in this wire format.
    fn encode_text(&self, text: &str) -> Vec<u8>;

    /// Incremental mapper from output chunks to visible reply text.
    fn response_map(&self) -> Box<dyn ResponseMap>;
}

/// Maps raw output chunks to the text the user should see.
pub trait ResponseMap: Send {
    fn map(&mut self, chunk: &[u8]) -> String;
}

/// Receiving end of a processor's passthrough.
///
/// A send only fails when the consumer dropped the output reader, which is
/// how cancellation reaches the loop.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<Result<Vec<u8>, Error>>,
}

impl OutputSink {
    pub fn new(tx: mpsc::Sender<Result<Vec<u8>, Error>>) -> Self {
        Self { tx }
    }

    /// Create a sink and the reader that yields everything sent into it.
    pub fn channel(buffer: usize) -> (Self, ByteStream) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), Box::pin(ReceiverStream::new(rx)))
    }

    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), Error> {
        self.tx.send(Ok(bytes)).await.map_err(|_| Error::Cancelled)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Incremental UTF-8 decoder.
///
/// A multi-byte character split across chunks is held back until its last
/// byte arrives. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // incomplete trailing character
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// A tool call still being assembled from fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl PendingToolCall {
    fn into_tool_call(self) -> Option<ToolCall> {
        if self.id.is_empty() || self.name.is_empty() {
            return None;
        }
        Some(ToolCall::new(self.id, self.name, self.arguments))
    }
}

/// Tool-call fragments keyed by their in-stream index, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct ToolCallAccumulator {
    slots: Vec<(u64, PendingToolCall)>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&mut self, index: u64) -> &mut PendingToolCall {
        let position = match self.slots.iter().position(|(i, _)| *i == index) {
            Some(position) => position,
            None => {
                self.slots.push((index, PendingToolCall::default()));
                self.slots.len() - 1
            }
        };
        &mut self.slots[position].1
    }

    /// Merge one delta into the slot for `index`. Non-empty `id`/`name`
    /// replace what was there; `arguments` is appended.
    pub fn merge(
        &mut self,
        index: u64,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        let slot = self.slot(index);
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            slot.id = id.to_string();
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            slot.name = name.to_string();
        }
        if let Some(arguments) = arguments {
            slot.arguments.push_str(arguments);
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        self.slots.iter().any(|(i, _)| *i == index)
    }

    pub fn remove(&mut self, index: u64) -> Option<PendingToolCall> {
        let position = self.slots.iter().position(|(i, _)| *i == index)?;
        Some(self.slots.remove(position).1)
    }

    /// Drain every slot in order as `(index, pending)`.
    pub fn drain(&mut self) -> impl Iterator<Item = (u64, PendingToolCall)> + '_ {
        self.slots.drain(..)
    }
}

/// Parse state shared by every wire format.
#[derive(Debug, Default)]
pub struct StreamState {
    pub raw_content: String,
    pub has_assistant_content: bool,
    /// Calls that are finished; pending fragments live in `pending`.
    pub completed: Vec<PendingToolCall>,
    pub pending: ToolCallAccumulator,
}

impl StreamState {
    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.raw_content.push_str(text);
        self.has_assistant_content = true;
    }

    pub fn complete(&mut self, call: PendingToolCall) {
        self.completed.push(call);
    }

    pub fn into_result(self) -> StreamProcessingResult {
        StreamProcessingResult {
            tool_calls: self
                .completed
                .into_iter()
                .filter_map(PendingToolCall::into_tool_call)
                .collect(),
            has_assistant_content: self.has_assistant_content,
            raw_content: self.raw_content,
        }
    }
}

/// Incremental parser for one wire format.
///
/// Must tolerate arbitrary split points: any input it cannot yet interpret is
/// kept until the next `feed` or dropped at `finish`.
pub trait StreamParser: Send {
    fn feed(&mut self, text: &str, state: &mut StreamState);

    fn finish(&mut self, state: &mut StreamState);
}

/// Drive `parser` over `reader`, forwarding each chunk to `sink` before
/// parsing its decoded copy.
pub async fn process_with<P: StreamParser>(
    mut parser: P,
    mut reader: ByteStream,
    sink: &OutputSink,
) -> Result<StreamProcessingResult, Error> {
    let mut decoder = Utf8Decoder::new();
    let mut state = StreamState::default();
    let mut chunks = 0usize;

    while let Some(chunk) = reader.next().await {
        let bytes = chunk?;
        chunks += 1;
        let text = decoder.decode(&bytes);
        sink.send(bytes).await?;
        parser.feed(&text, &mut state);
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        parser.feed(&tail, &mut state);
    }
    parser.finish(&mut state);

    let result = state.into_result();
    trace!(
        chunks,
        content_len = result.raw_content.len(),
        tool_calls = result.tool_calls.len(),
        "Stream pass finished"
    );
    Ok(result)
}

/// A [`ResponseMap`] built on a format's own [`StreamParser`].
pub struct ParserResponseMap<P> {
    parser: P,
    decoder: Utf8Decoder,
    state: StreamState,
    emitted: usize,
}

impl<P: StreamParser> ParserResponseMap<P> {
    pub fn new(parser: P) -> Self {
        Self {
            parser,
            decoder: Utf8Decoder::new(),
            state: StreamState::default(),
            emitted: 0,
        }
    }
}

impl<P: StreamParser> ResponseMap for ParserResponseMap<P> {
    fn map(&mut self, chunk: &[u8]) -> String {
        let text = self.decoder.decode(chunk);
        self.parser.feed(&text, &mut self.state);
        let delta = self.state.raw_content[self.emitted..].to_string();
        self.emitted = self.state.raw_content.len();
        delta
    }
}
