//! LLM-backed context compression.
//!
//! Two operations keep a conversation inside its token budget: collapsing the
//! whole history into one summary entry, and condensing a single oversized
//! tool output. Neither ever fails; both degrade to plain truncation.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::Error;
use crate::message::{ConversationItem, Message, ResponseItem};
use crate::provider::{CompletionRequest, Provider};
use crate::tokens::{estimate_tokens, should_compress};
use crate::tool::ToolExecutionResult;

/// Marker opening the synthetic entry that replaces a compressed history.
pub const SUMMARY_PREFIX: &str = "[Resumo do contexto anterior]\n";

/// Characters kept when a summarization call fails.
pub const FALLBACK_CHARS: usize = 4000;

/// Tool results whose JSON is longer than this are candidates for condensing.
pub const TOOL_RESULT_SUMMARY_THRESHOLD_CHARS: usize = 4000;

/// Characters of a tool output shown to the extraction prompt.
pub const TOOL_OUTPUT_WINDOW_CHARS: usize = 15_000;

const HISTORY_SUMMARY_PROMPT: &str = r#"Você é um assistente que resume conversas. Resuma o histórico abaixo em tópicos curtos, em português do Brasil.

Preserve:
- fatos informados pelo usuário (nomes, preferências, dados pessoais relevantes)
- decisões tomadas e conclusões alcançadas
- trechos de código, caminhos de arquivos, comandos e mensagens de erro exatos
- pendências e perguntas ainda em aberto

Descarte:
- saudações, agradecimentos e conversa trivial
- etapas intermediárias já resolvidas

Responda apenas com os tópicos.

Histórico:
{history}"#;

const TOOL_EXTRACTION_PROMPT: &str = r#"Extract only the information relevant to the user's original query from this tool output. Keep exact figures, names, dates, URLs and quotes that matter; drop navigation text, boilerplate and anything unrelated. Answer with the extracted information only.

Original user query:
{query}

Tool: {tool}

Tool output (first {window} characters considered):
{output}"#;

/// Result of [`ContextCompressor::compress_if_needed`].
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub history: Vec<ConversationItem>,
    pub did_compress: bool,
}

pub struct ContextCompressor {
    provider: Arc<dyn Provider>,
    model: Option<String>,
}

impl ContextCompressor {
    pub fn new(provider: Arc<dyn Provider>, model: Option<String>) -> Self {
        Self { provider, model }
    }

    fn build_request(&self, prompt: String) -> CompletionRequest {
        let mut request = CompletionRequest::prompt(prompt);
        if let Some(ref model) = self.model {
            request = request.with_model(model);
        }
        request
    }

    async fn complete_text(&self, prompt: String) -> Result<String, Error> {
        let response = self.provider.complete(self.build_request(prompt)).await?;
        let text = response.message.text().trim().to_string();
        if text.is_empty() {
            return Err(Error::Unknown("Summarizer returned empty response".to_string()));
        }
        Ok(text)
    }

    /// Compress `history` when its own estimate crosses the threshold.
    pub async fn compress_if_needed(
        &self,
        history: Vec<ConversationItem>,
        max_tokens: usize,
    ) -> CompressionOutcome {
        let estimated = estimate_tokens(&history);
        self.compress_if_over(history, estimated, max_tokens).await
    }

    /// Compress `history` when `estimated_tokens` (which may include content
    /// about to be appended) crosses the threshold. Otherwise `history` is
    /// handed back untouched.
    pub async fn compress_if_over(
        &self,
        history: Vec<ConversationItem>,
        estimated_tokens: usize,
        max_tokens: usize,
    ) -> CompressionOutcome {
        if !should_compress(estimated_tokens, max_tokens) {
            return CompressionOutcome {
                history,
                did_compress: false,
            };
        }

        debug!(
            estimated_tokens,
            max_tokens,
            entries = history.len(),
            "Compressing conversation history"
        );

        let rendered = render_history(&history);
        let summary = match self
            .complete_text(HISTORY_SUMMARY_PROMPT.replace("{history}", &rendered))
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "History summarization failed, truncating instead");
                truncate_chars(&rendered, FALLBACK_CHARS)
            }
        };

        CompressionOutcome {
            history: vec![Message::assistant(format!("{SUMMARY_PREFIX}{summary}")).into()],
            did_compress: true,
        }
    }

    /// Condense one oversized tool output to what matters for `user_query`.
    ///
    /// Errors and results under the threshold are returned unchanged.
    pub async fn summarize_tool_result(
        &self,
        mut result: ToolExecutionResult,
        user_query: &str,
    ) -> ToolExecutionResult {
        let output = result_text(&result.result);
        if result.is_error() || output.chars().count() <= TOOL_RESULT_SUMMARY_THRESHOLD_CHARS {
            return result;
        }

        let prompt = TOOL_EXTRACTION_PROMPT
            .replace("{window}", &TOOL_OUTPUT_WINDOW_CHARS.to_string())
            .replace("{query}", user_query)
            .replace("{tool}", &result.tool_name)
            .replace("{output}", &truncate_chars(&output, TOOL_OUTPUT_WINDOW_CHARS));

        result.result = match self.complete_text(prompt).await {
            Ok(summary) => {
                debug!(
                    tool = %result.tool_name,
                    before = output.len(),
                    after = summary.len(),
                    "Condensed tool result"
                );
                json!({ "summary": summary })
            }
            Err(e) => {
                warn!(tool = %result.tool_name, error = %e, "Tool result summarization failed");
                json!({
                    "content": truncate_chars(&output, FALLBACK_CHARS),
                    "_summarization_failed": true,
                })
            }
        };
        result
    }
}

/// Plain text of a tool result: strings as-is, everything else as JSON.
fn result_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}

/// Readable transcript of the history for the summarizer.
pub fn render_history(history: &[ConversationItem]) -> String {
    let mut out = String::new();
    for item in history {
        match item {
            ConversationItem::Message(msg) => {
                out.push_str(&format!("[{}]: {}\n", msg.role, msg.text()));
                for tc in &msg.tool_calls {
                    out.push_str(&format!(
                        "  -> tool_call: {}({})\n",
                        tc.function.name, tc.function.arguments
                    ));
                }
            }
            ConversationItem::Item(ResponseItem::FunctionCall {
                name, arguments, ..
            }) => {
                out.push_str(&format!("  -> tool_call: {}({})\n", name, arguments));
            }
            ConversationItem::Item(ResponseItem::FunctionCallOutput { call_id, output }) => {
                out.push_str(&format!("[tool {}]: {}\n", call_id, output));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    fn long_history(chars: usize) -> Vec<ConversationItem> {
        vec![
            Message::user("x".repeat(chars)).into(),
            Message::assistant("ok").into(),
        ]
    }

    fn tool_result(value: Value) -> ToolExecutionResult {
        ToolExecutionResult {
            tool_call_id: "c1".into(),
            tool_name: "fetch_webpage".into(),
            arguments: "{}".into(),
            result: value,
            execution_time_ms: 3,
        }
    }

    #[tokio::test]
    async fn test_under_threshold_returns_same_history() {
        let provider = Arc::new(MockProvider::new());
        let compressor = ContextCompressor::new(provider.clone(), None);

        let history = long_history(10);
        let ptr = history.as_ptr();
        let outcome = compressor.compress_if_needed(history, 10_000).await;

        assert!(!outcome.did_compress);
        assert_eq!(outcome.history.as_ptr(), ptr);
        assert_eq!(outcome.history.len(), 2);
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_over_threshold_replaces_history_with_summary() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_response("- usuário quer X");
        let compressor = ContextCompressor::new(provider.clone(), Some("small".into()));

        let outcome = compressor.compress_if_needed(long_history(4000), 1000).await;

        assert!(outcome.did_compress);
        assert_eq!(outcome.history.len(), 1);
        let msg = outcome.history[0].as_message().unwrap();
        assert_eq!(msg.role, crate::message::Role::Assistant);
        assert_eq!(msg.text(), "[Resumo do contexto anterior]\n- usuário quer X");

        let request = provider.last_request().unwrap();
        assert!(!request.stream);
        assert_eq!(request.model.as_deref(), Some("small"));
        let prompt = request.messages[0].as_message().unwrap().text().to_string();
        assert!(prompt.contains("português do Brasil"));
        assert!(prompt.contains("[user]: xxx"));
    }

    #[tokio::test]
    async fn test_summary_failure_falls_back_to_truncation() {
        let provider = Arc::new(MockProvider::new());
        let compressor = ContextCompressor::new(provider, None);

        let outcome = compressor.compress_if_needed(long_history(9000), 1000).await;

        assert!(outcome.did_compress);
        let text = outcome.history[0].as_message().unwrap().text().to_string();
        assert!(text.starts_with(SUMMARY_PREFIX));
        assert_eq!(text.chars().count(), SUMMARY_PREFIX.chars().count() + FALLBACK_CHARS);
    }

    #[tokio::test]
    async fn test_compress_if_over_uses_projected_estimate() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_response("resumo");
        let compressor = ContextCompressor::new(provider, None);

        let outcome = compressor.compress_if_over(long_history(10), 900, 1000).await;
        assert!(outcome.did_compress);
    }

    #[tokio::test]
    async fn test_small_tool_result_untouched() {
        let provider = Arc::new(MockProvider::new());
        let compressor = ContextCompressor::new(provider.clone(), None);

        let result = tool_result(json!({"title": "short"}));
        let out = compressor.summarize_tool_result(result.clone(), "q").await;
        assert_eq!(out, result);
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_large_tool_result_summarized() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_response("the price is 42");
        let compressor = ContextCompressor::new(provider.clone(), None);

        let big = "lorem ipsum ".repeat(3000);
        let out = compressor
            .summarize_tool_result(tool_result(Value::String(big)), "what is the price?")
            .await;
        assert_eq!(out.result, json!({"summary": "the price is 42"}));

        let prompt = provider.last_request().unwrap().messages[0]
            .as_message()
            .unwrap()
            .text()
            .to_string();
        assert!(prompt.contains("what is the price?"));
        assert!(prompt.contains("fetch_webpage"));
        assert!(prompt.len() < TOOL_OUTPUT_WINDOW_CHARS + 1000);
    }

    #[tokio::test]
    async fn test_large_tool_result_failure_truncates() {
        let provider = Arc::new(MockProvider::new());
        let compressor = ContextCompressor::new(provider, None);

        let big = "y".repeat(20_000);
        let out = compressor
            .summarize_tool_result(tool_result(Value::String(big)), "q")
            .await;
        assert_eq!(out.result["_summarization_failed"], json!(true));
        assert_eq!(out.result["content"].as_str().unwrap().len(), FALLBACK_CHARS);
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("ação", 2), "aç");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
