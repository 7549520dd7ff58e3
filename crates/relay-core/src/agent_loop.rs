//! The agent loop executor.
//!
//! One invocation drives a single user request: process the backend stream,
//! run the requested tools one at a time, fold their results back into the
//! conversation, and call the backend again until it stops asking for tools.
//! Everything the backend streams is forwarded to a single output reader as
//! it arrives, across all iterations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::compression::ContextCompressor;
use crate::error::Error;
use crate::message::{last_user_text, ConversationItem};
use crate::provider::{ByteStream, Generator, Provider};
use crate::stream::{OutputSink, StreamProcessor};
use crate::tokens::{estimate_tokens, should_compress};
use crate::tool::{execute_tool_call, ToolExecutionResult, ToolRegistry};

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 128_000;

/// Chunks buffered between the loop and the output reader.
const OUTPUT_BUFFER: usize = 64;

/// Events emitted during the loop for progress reporting.
#[derive(Debug, Clone)]
pub enum AgentProgressEvent {
    IterationStart {
        iteration: u32,
        max_iterations: u32,
    },
    ToolExecuted {
        iteration: u32,
        result: ToolExecutionResult,
    },
    IterationComplete {
        iteration: u32,
        tool_calls: usize,
        has_assistant_content: bool,
    },
}

/// Receives [`AgentProgressEvent`]s while a loop runs.
#[async_trait]
pub trait AgentProgressHandler: Send + Sync {
    async fn on_progress(&self, event: AgentProgressEvent);
}

/// Settings for one loop invocation.
#[derive(Clone)]
pub struct AgentLoopConfig {
    pub max_iterations: u32,
    /// Per-tool limit; a tool still running after this is abandoned.
    pub tool_execution_timeout: Duration,
    pub enable_tool_result_summarization: bool,
    /// Context budget the compression threshold is measured against.
    pub max_context_tokens: usize,
    pub progress: Option<Arc<dyn AgentProgressHandler>>,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tool_execution_timeout: DEFAULT_TOOL_TIMEOUT,
            enable_tool_result_summarization: true,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            progress: None,
        }
    }
}

impl std::fmt::Debug for AgentLoopConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoopConfig")
            .field("max_iterations", &self.max_iterations)
            .field("tool_execution_timeout", &self.tool_execution_timeout)
            .field(
                "enable_tool_result_summarization",
                &self.enable_tool_result_summarization,
            )
            .field("max_context_tokens", &self.max_context_tokens)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl AgentLoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_execution_timeout = timeout;
        self
    }

    pub fn with_summarization(mut self, enabled: bool) -> Self {
        self.enable_tool_result_summarization = enabled;
        self
    }

    pub fn with_max_context_tokens(mut self, max: usize) -> Self {
        self.max_context_tokens = max;
        self
    }

    pub fn with_progress(mut self, handler: Arc<dyn AgentProgressHandler>) -> Self {
        self.progress = Some(handler);
        self
    }
}

#[derive(Debug, Default)]
struct AgentLoopState {
    iteration: u32,
    total_tokens_estimate: usize,
    is_complete: bool,
    hit_iteration_limit: bool,
    last_error: Option<String>,
}

/// How a loop invocation ended.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Iterations that actually processed a stream.
    pub iterations: u32,
    /// The backend produced a turn without tool calls.
    pub completed: bool,
    pub hit_iteration_limit: bool,
    /// Conversation as last sent to the backend.
    pub conversation: Vec<ConversationItem>,
    pub total_tokens_estimate: usize,
    pub last_error: Option<String>,
}

pub fn iteration_limit_notice(max_iterations: u32) -> String {
    format!(
        "\n\n⚠️ Limite de {} iterações atingido. Encerrando o processamento de ferramentas.",
        max_iterations
    )
}

pub fn error_notice(error: &Error) -> String {
    format!("\n\n❌ Erro ao processar a resposta: {}", error)
}

pub struct AgentLoop {
    processor: Arc<dyn StreamProcessor>,
    tools: Arc<ToolRegistry>,
    compressor: ContextCompressor,
    config: AgentLoopConfig,
}

impl AgentLoop {
    /// `provider` serves the non-streaming summarization calls.
    pub fn new(
        processor: Arc<dyn StreamProcessor>,
        tools: Arc<ToolRegistry>,
        provider: Arc<dyn Provider>,
        config: AgentLoopConfig,
    ) -> Self {
        Self {
            processor,
            tools,
            compressor: ContextCompressor::new(provider, None),
            config,
        }
    }

    pub fn with_compressor(mut self, compressor: ContextCompressor) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn config(&self) -> &AgentLoopConfig {
        &self.config
    }

    /// Start the loop in the background and return its output reader.
    ///
    /// Dropping the reader stops the loop at its next write and closes the
    /// upstream stream it was reading.
    pub fn run(
        self,
        reader: ByteStream,
        conversation: Vec<ConversationItem>,
        generator: Arc<dyn Generator>,
    ) -> ByteStream {
        let (sink, output) = OutputSink::channel(OUTPUT_BUFFER);
        tokio::spawn(async move {
            self.drive(reader, conversation, generator.as_ref(), &sink)
                .await;
        });
        output
    }

    /// Run the loop to completion, writing all output to `sink`.
    ///
    /// Never returns an error: failures end up in the output as a notice and
    /// in [`LoopOutcome::last_error`].
    pub async fn drive(
        &self,
        reader: ByteStream,
        conversation: Vec<ConversationItem>,
        generator: &dyn Generator,
        sink: &OutputSink,
    ) -> LoopOutcome {
        let mut state = AgentLoopState::default();
        let mut conversation = conversation;

        match self
            .iterate(&mut state, &mut conversation, reader, generator, sink)
            .await
        {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                debug!(iteration = state.iteration, "Output reader dropped, stopping loop");
                state.last_error = Some(Error::Cancelled.to_string());
            }
            Err(e) => {
                error!(iteration = state.iteration, error = %e, "Agent loop failed");
                state.last_error = Some(e.to_string());
                let _ = sink.send(self.processor.encode_text(&error_notice(&e))).await;
            }
        }

        LoopOutcome {
            iterations: state.iteration.min(self.config.max_iterations),
            completed: state.is_complete,
            hit_iteration_limit: state.hit_iteration_limit,
            conversation,
            total_tokens_estimate: state.total_tokens_estimate,
            last_error: state.last_error,
        }
    }

    async fn iterate(
        &self,
        state: &mut AgentLoopState,
        conversation: &mut Vec<ConversationItem>,
        reader: ByteStream,
        generator: &dyn Generator,
        sink: &OutputSink,
    ) -> Result<(), Error> {
        let max_tokens = self.config.max_context_tokens;
        let history = std::mem::take(conversation);
        let outcome = self.compressor.compress_if_needed(history, max_tokens).await;
        if outcome.did_compress {
            info!("Conversation compressed before the first pass");
        }
        *conversation = outcome.history;

        let mut next_reader = Some(reader);

        loop {
            state.iteration += 1;
            if state.iteration > self.config.max_iterations {
                warn!(
                    max_iterations = self.config.max_iterations,
                    "Iteration limit reached"
                );
                state.hit_iteration_limit = true;
                let notice = iteration_limit_notice(self.config.max_iterations);
                sink.send(self.processor.encode_text(&notice)).await?;
                return Ok(());
            }

            let iteration = state.iteration;
            self.emit(AgentProgressEvent::IterationStart {
                iteration,
                max_iterations: self.config.max_iterations,
            })
            .await;

            let reader = match next_reader.take() {
                Some(reader) => reader,
                None => {
                    // no one is reading; don't open another backend request
                    if sink.is_closed() {
                        return Err(Error::Cancelled);
                    }
                    generator.generate(conversation).await?
                }
            };

            debug!(
                iteration,
                processor = self.processor.name(),
                conversation_len = conversation.len(),
                "Processing stream"
            );
            let pass = self.processor.process_stream(reader, sink).await?;

            if pass.tool_calls.is_empty() {
                debug!(iteration, content_len = pass.raw_content.len(), "Agent loop complete");
                state.is_complete = true;
                self.emit(AgentProgressEvent::IterationComplete {
                    iteration,
                    tool_calls: 0,
                    has_assistant_content: pass.has_assistant_content,
                })
                .await;
                return Ok(());
            }

            debug!(iteration, tool_count = pass.tool_calls.len(), "Executing tools");
            let mut results = Vec::with_capacity(pass.tool_calls.len());
            for call in &pass.tool_calls {
                if sink.is_closed() {
                    return Err(Error::Cancelled);
                }
                let result =
                    execute_tool_call(&self.tools, call, self.config.tool_execution_timeout).await;
                debug!(
                    tool = %result.tool_name,
                    elapsed_ms = result.execution_time_ms,
                    is_error = result.is_error(),
                    "Tool finished"
                );
                self.emit(AgentProgressEvent::ToolExecuted {
                    iteration,
                    result: result.clone(),
                })
                .await;
                results.push(result);
            }

            let results = self.fit_to_budget(state, conversation, results).await;
            conversation.extend(self.processor.format_tool_results_for_next_call(&results));

            self.emit(AgentProgressEvent::IterationComplete {
                iteration,
                tool_calls: results.len(),
                has_assistant_content: pass.has_assistant_content,
            })
            .await;
        }
    }

    /// Keep the next request inside the context budget: condense oversized
    /// tool outputs, then collapse the history if it is still too large.
    async fn fit_to_budget(
        &self,
        state: &mut AgentLoopState,
        conversation: &mut Vec<ConversationItem>,
        results: Vec<ToolExecutionResult>,
    ) -> Vec<ToolExecutionResult> {
        let max_tokens = self.config.max_context_tokens;
        let projected = estimate_tokens(conversation.as_slice()) + estimate_tokens(&results);
        state.total_tokens_estimate = projected;

        if !should_compress(projected, max_tokens) {
            return results;
        }

        debug!(projected, max_tokens, "Tool results push context over budget");

        let results = if self.config.enable_tool_result_summarization {
            let query = last_user_text(conversation).unwrap_or_default().to_string();
            let mut condensed = Vec::with_capacity(results.len());
            for result in results {
                condensed.push(self.compressor.summarize_tool_result(result, &query).await);
            }
            condensed
        } else {
            results
        };

        let projected = estimate_tokens(conversation.as_slice()) + estimate_tokens(&results);
        let history = std::mem::take(conversation);
        let outcome = self
            .compressor
            .compress_if_over(history, projected, max_tokens)
            .await;
        if outcome.did_compress {
            info!(projected, "Conversation compressed before folding tool results");
        }
        *conversation = outcome.history;
        state.total_tokens_estimate =
            estimate_tokens(conversation.as_slice()) + estimate_tokens(&results);

        results
    }

    async fn emit(&self, event: AgentProgressEvent) {
        if let Some(ref handler) = self.config.progress {
            handler.on_progress(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Role};
    use crate::stream::{
        process_with, ParserResponseMap, PendingToolCall, ResponseMap, StreamParser,
        StreamProcessingResult, StreamState,
    };
    use crate::testing::{byte_stream, collect_stream, FnTool, MockGenerator, MockProvider};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Line protocol for exercising the loop: `call <id> <name> <args>` lines
    /// request tools, every other line is assistant text.
    #[derive(Default)]
    struct LineParser {
        buffer: String,
    }

    impl LineParser {
        fn line(&mut self, line: &str, state: &mut StreamState) {
            let mut parts = line.splitn(4, ' ');
            if parts.next() == Some("call") {
                let id = parts.next().unwrap_or_default().to_string();
                let name = parts.next().unwrap_or_default().to_string();
                let arguments = parts.next().unwrap_or_default().to_string();
                state.complete(PendingToolCall { id, name, arguments });
            } else {
                state.push_text(line);
            }
        }
    }

    impl StreamParser for LineParser {
        fn feed(&mut self, text: &str, state: &mut StreamState) {
            self.buffer.push_str(text);
            while let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                self.line(line.trim_end_matches('\n'), state);
            }
        }

        fn finish(&mut self, state: &mut StreamState) {
            let rest = std::mem::take(&mut self.buffer);
            if !rest.is_empty() {
                self.line(&rest, state);
            }
        }
    }

    struct LineProcessor;

    #[async_trait]
    impl StreamProcessor for LineProcessor {
        fn name(&self) -> &str {
            "line"
        }

        async fn process_stream(
            &self,
            reader: ByteStream,
            sink: &OutputSink,
        ) -> Result<StreamProcessingResult, Error> {
            process_with(LineParser::default(), reader, sink).await
        }

        fn format_tool_results_for_next_call(
            &self,
            results: &[ToolExecutionResult],
        ) -> Vec<ConversationItem> {
            let calls: Vec<_> = results.iter().map(|r| r.tool_call()).collect();
            let mut items = vec![Message::assistant_with_tool_calls(None, &calls).into()];
            for r in results {
                items.push(Message::tool_result(&r.tool_call_id, r.result_json()).into());
            }
            items
        }

        fn encode_text(&self, text: &str) -> Vec<u8> {
            text.as_bytes().to_vec()
        }

        fn response_map(&self) -> Box<dyn ResponseMap> {
            Box::new(ParserResponseMap::new(LineParser::default()))
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<AgentProgressEvent>>,
    }

    #[async_trait]
    impl AgentProgressHandler for RecordingProgress {
        async fn on_progress(&self, event: AgentProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Drops the output reader as soon as a tool has run.
    struct DropOutputOnTool {
        output: Mutex<Option<ByteStream>>,
        executed: Mutex<usize>,
    }

    #[async_trait]
    impl AgentProgressHandler for DropOutputOnTool {
        async fn on_progress(&self, event: AgentProgressEvent) {
            if let AgentProgressEvent::ToolExecuted { .. } = event {
                *self.executed.lock().unwrap() += 1;
                self.output.lock().unwrap().take();
            }
        }
    }

    fn tools() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new().with_tools([
            FnTool::new("search", |args| Ok(json!({"hits": [args["q"].clone()]}))).into_arc(),
            FnTool::new("fail", |_| Err(Error::tool("fail", "backend down"))).into_arc(),
            FnTool::pending("hang").into_arc(),
        ]))
    }

    fn agent(config: AgentLoopConfig) -> (AgentLoop, Arc<MockProvider>) {
        let provider = Arc::new(MockProvider::new());
        let agent = AgentLoop::new(Arc::new(LineProcessor), tools(), provider.clone(), config);
        (agent, provider)
    }

    fn conversation() -> Vec<ConversationItem> {
        vec![Message::user("find x").into()]
    }

    async fn drive(
        agent: &AgentLoop,
        first: ByteStream,
        generator: &MockGenerator,
    ) -> (LoopOutcome, String) {
        let (sink, output) = OutputSink::channel(1024);
        let outcome = agent.drive(first, conversation(), generator, &sink).await;
        drop(sink);
        (outcome, collect_stream(output).await)
    }

    #[tokio::test]
    async fn test_no_tool_calls_completes_in_one_iteration() {
        let (agent, _) = agent(AgentLoopConfig::default());
        let generator = MockGenerator::new();

        let (outcome, output) = drive(&agent, byte_stream(["Hello ", "there"]), &generator).await;

        assert!(outcome.completed);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(output, "Hello there");
        assert_eq!(generator.call_count(), 0);
        assert!(outcome.last_error.is_none());
    }

    #[tokio::test]
    async fn test_tool_round_trip_and_reinvoke() {
        let (agent, _) = agent(AgentLoopConfig::default());
        let generator = MockGenerator::new();
        generator.queue(["x is 42"]);

        let (outcome, output) = drive(
            &agent,
            byte_stream(["Looking\ncall c1 search {\"q\":\"x\"}\n"]),
            &generator,
        )
        .await;

        assert!(outcome.completed);
        assert_eq!(outcome.iterations, 2);
        assert!(output.starts_with("Looking\ncall c1"));
        assert!(output.ends_with("x is 42"));

        let sent = generator.last_conversation().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].role(), Some(Role::Assistant));
        let tool_msg = sent[2].as_message().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool_msg.text(), r#"{"hits":["x"]}"#);
    }

    #[tokio::test]
    async fn test_tools_run_sequentially_in_call_order() {
        let progress = Arc::new(RecordingProgress::default());
        let (agent, _) = agent(AgentLoopConfig::default().with_progress(progress.clone()));
        let generator = MockGenerator::new();
        generator.queue(["done"]);

        drive(
            &agent,
            byte_stream(["call a fail {}\ncall b search {\"q\":1}\ncall c nope {}\n"]),
            &generator,
        )
        .await;

        let events = progress.events.lock().unwrap();
        let executed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                AgentProgressEvent::ToolExecuted { result, .. } => Some(result.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            executed.iter().map(|r| r.tool_call_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert!(executed[0].is_error());
        assert!(!executed[1].is_error());
        assert_eq!(executed[2].result, json!({"error": "Unknown tool 'nope'"}));

        assert!(matches!(
            events.first(),
            Some(AgentProgressEvent::IterationStart { iteration: 1, max_iterations: 10 })
        ));
        assert!(matches!(
            events.last(),
            Some(AgentProgressEvent::IterationComplete { iteration: 2, tool_calls: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_hanging_tool_times_out_without_blocking() {
        let (agent, _) = agent(
            AgentLoopConfig::default().with_tool_timeout(Duration::from_millis(10)),
        );
        let generator = MockGenerator::new();
        generator.queue(["recovered"]);

        let started = Instant::now();
        let (outcome, output) = drive(&agent, byte_stream(["call h hang {}\n"]), &generator).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(outcome.completed);
        assert!(output.ends_with("recovered"));
        let sent = generator.last_conversation().unwrap();
        let tool_msg = sent.last().unwrap().as_message().unwrap();
        assert!(tool_msg.text().contains("\"error\""));
        assert!(tool_msg.text().contains("timed out"));
    }

    #[tokio::test]
    async fn test_iteration_limit_emits_warning() {
        let (agent, _) = agent(AgentLoopConfig::default().with_max_iterations(1));
        let generator = MockGenerator::repeating(["call c1 search {\"q\":\"x\"}\n"]);

        let (outcome, output) = drive(
            &agent,
            byte_stream(["call c0 search {\"q\":\"x\"}\n"]),
            &generator,
        )
        .await;

        assert_eq!(outcome.iterations, 1);
        assert!(outcome.hit_iteration_limit);
        assert!(!outcome.completed);
        assert!(outcome.last_error.is_none());
        assert!(output.contains("Limite de 1 iterações atingido"));
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_generate_failure_emits_single_error_chunk() {
        let (agent, _) = agent(AgentLoopConfig::default());
        let generator = MockGenerator::new();
        generator.queue_error("connection refused");

        let (outcome, output) =
            drive(&agent, byte_stream(["call c1 search {}\n"]), &generator).await;

        assert!(!outcome.completed);
        assert!(outcome.last_error.unwrap().contains("connection refused"));
        assert_eq!(output.matches("❌").count(), 1);
        assert!(output.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_oversized_results_are_summarized() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_response("x is 42");
        let big = "z".repeat(10_000);
        let tools = Arc::new(ToolRegistry::new().with_tools([FnTool::new(
            "fetch",
            move |_| Ok(json!(big.clone())),
        )
        .into_arc()]));
        let agent = AgentLoop::new(
            Arc::new(LineProcessor),
            tools,
            provider.clone(),
            AgentLoopConfig::default().with_max_context_tokens(2_000),
        );
        let generator = MockGenerator::new();
        generator.queue(["final"]);

        let (outcome, _) = drive(&agent, byte_stream(["call f1 fetch {}\n"]), &generator).await;

        assert!(outcome.completed);
        let sent = generator.last_conversation().unwrap();
        let tool_msg = sent.last().unwrap().as_message().unwrap();
        assert_eq!(tool_msg.text(), r#"{"summary":"x is 42"}"#);
        // only the extraction call was needed
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test]
    async fn test_summarization_disabled_keeps_results() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_response("resumo");
        let big = "z".repeat(10_000);
        let tools = Arc::new(ToolRegistry::new().with_tools([FnTool::new(
            "fetch",
            move |_| Ok(json!(big.clone())),
        )
        .into_arc()]));
        let agent = AgentLoop::new(
            Arc::new(LineProcessor),
            tools,
            provider.clone(),
            AgentLoopConfig::default()
                .with_max_context_tokens(2_000)
                .with_summarization(false),
        );
        let generator = MockGenerator::new();
        generator.queue(["final"]);

        drive(&agent, byte_stream(["call f1 fetch {}\n"]), &generator).await;

        let sent = generator.last_conversation().unwrap();
        // history collapsed into the summary entry, raw result kept
        assert!(sent[0]
            .as_message()
            .unwrap()
            .text()
            .starts_with("[Resumo do contexto anterior]"));
        let tool_msg = sent.last().unwrap().as_message().unwrap();
        assert_eq!(tool_msg.text().len(), 10_002);
    }

    async fn drive_dropping_output(first: &str) -> (LoopOutcome, usize, usize) {
        let (sink, output) = OutputSink::channel(1024);
        let handler = Arc::new(DropOutputOnTool {
            output: Mutex::new(Some(output)),
            executed: Mutex::new(0),
        });
        let (agent, _) = agent(AgentLoopConfig::default().with_progress(handler.clone()));
        let generator = MockGenerator::repeating(["never read"]);

        let outcome = agent
            .drive(byte_stream([first.to_string()]), conversation(), &generator, &sink)
            .await;
        let executed = *handler.executed.lock().unwrap();
        (outcome, executed, generator.call_count())
    }

    #[tokio::test]
    async fn test_dropped_output_skips_remaining_tools() {
        let (outcome, executed, generated) =
            drive_dropping_output("call c1 search {\"q\":\"a\"}\ncall c2 search {\"q\":\"b\"}\n").await;

        assert_eq!(executed, 1);
        assert_eq!(generated, 0);
        assert!(!outcome.completed);
        assert_eq!(outcome.last_error.as_deref(), Some("Cancelled"));
    }

    #[tokio::test]
    async fn test_dropped_output_skips_next_generate() {
        let (outcome, executed, generated) =
            drive_dropping_output("call c1 search {\"q\":\"a\"}\n").await;

        assert_eq!(executed, 1);
        assert_eq!(generated, 0);
        assert_eq!(outcome.last_error.as_deref(), Some("Cancelled"));
    }

    #[tokio::test]
    async fn test_run_returns_live_output() {
        let (agent, _) = agent(AgentLoopConfig::default());
        let generator = Arc::new(MockGenerator::new());
        generator.queue(["second"]);

        let output = agent.run(
            byte_stream(["first\ncall c1 search {}\n"]),
            conversation(),
            generator.clone(),
        );

        let text = collect_stream(output).await;
        assert!(text.starts_with("first\n"));
        assert!(text.ends_with("second"));
        assert_eq!(generator.call_count(), 1);
    }
}
