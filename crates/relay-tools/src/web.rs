//! Web tools: page fetching and search.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use relay_core::{Error, PropertySchema, Tool, ToolDefinition, ToolParameters};

const USER_AGENT: &str = concat!("relay/", env!("CARGO_PKG_VERSION"));

/// Characters of page text returned before truncating.
pub const MAX_PAGE_CHARS: usize = 50_000;

const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "aside", "noscript",
];

const MAIN_CONTENT: &str = "main, article, .content, #content, .post, .entry";

/// Where `web_search` sends its queries (a Perplexica instance).
#[derive(Clone, Debug)]
pub struct WebSearchConfig {
    /// Base URL, e.g. "http://localhost:3000"
    pub host: String,
    pub chat_model: String,
    pub embed_model: String,
}

impl WebSearchConfig {
    pub fn new(
        host: impl Into<String>,
        chat_model: impl Into<String>,
        embed_model: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            chat_model: chat_model.into(),
            embed_model: embed_model.into(),
        }
    }
}

fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

// =============================================================================
// fetch_webpage
// =============================================================================

pub struct FetchWebpageTool {
    client: Client,
}

impl Default for FetchWebpageTool {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchWebpageTool {
    pub fn new() -> Self {
        Self {
            client: http_client(Duration::from_secs(30)),
        }
    }
}

#[derive(Deserialize)]
struct FetchWebpageArgs {
    url: String,
    #[serde(default)]
    selector: Option<String>,
}

#[async_trait]
impl Tool for FetchWebpageTool {
    fn name(&self) -> &str {
        "fetch_webpage"
    }

    fn description(&self) -> &str {
        "Fetch a webpage and extract its text content. Optionally filter by CSS selector."
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new()
                .add_property("url", PropertySchema::string("URL of the webpage to fetch"), true)
                .add_property(
                    "selector",
                    PropertySchema::string(
                        "Optional CSS selector to extract specific content (e.g., 'main', 'article')",
                    ),
                    false,
                ),
        )
    }

    async fn execute(&self, arguments: Value) -> Result<Value, Error> {
        let args: FetchWebpageArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::tool("fetch_webpage", format!("Invalid arguments: {}", e)))?;

        let response = self.client.get(&args.url).send().await.map_err(|e| {
            Error::tool("fetch_webpage", format!("Failed to fetch '{}': {}", args.url, e))
        })?;

        if !response.status().is_success() {
            return Err(Error::tool(
                "fetch_webpage",
                format!("HTTP error {}: {}", response.status(), args.url),
            ));
        }

        let html = response.text().await.map_err(|e| {
            Error::tool("fetch_webpage", format!("Failed to read response: {}", e))
        })?;

        let page = extract_page(&html, args.selector.as_deref())?;
        debug!(url = %args.url, chars = page.content.len(), truncated = page.truncated, "Fetched page");

        Ok(json!({
            "url": args.url,
            "title": page.title,
            "content": page.content,
            "truncated": page.truncated,
        }))
    }
}

#[derive(Debug)]
struct Page {
    title: Option<String>,
    content: String,
    truncated: bool,
}

fn extract_page(html: &str, selector: Option<&str>) -> Result<Page, Error> {
    let document = Html::parse_document(html);

    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .map(|el| clean_text(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty());

    let text = match selector {
        Some(selector) => {
            let selector = Selector::parse(selector).map_err(|_| {
                Error::tool("fetch_webpage", format!("Invalid selector: {}", selector))
            })?;
            join_elements(document.select(&selector))
        }
        None => default_content(&document),
    };

    let cleaned = clean_text(&text);
    let total = cleaned.chars().count();
    let (content, truncated) = if total > MAX_PAGE_CHARS {
        let cut: String = cleaned.chars().take(MAX_PAGE_CHARS).collect();
        (cut, true)
    } else if cleaned.is_empty() {
        ("(No text content found on page)".to_string(), false)
    } else {
        (cleaned, false)
    };

    Ok(Page {
        title,
        content,
        truncated,
    })
}

/// Main content when the page marks it, otherwise the whole body.
fn default_content(document: &Html) -> String {
    if let Ok(main) = Selector::parse(MAIN_CONTENT) {
        let found: Vec<ElementRef> = document.select(&main).collect();
        if !found.is_empty() {
            return join_elements(found.into_iter());
        }
    }
    match Selector::parse("body") {
        Ok(body) => join_elements(document.select(&body)),
        Err(_) => extract_text(&document.root_element()),
    }
}

fn join_elements<'a>(elements: impl Iterator<Item = ElementRef<'a>>) -> String {
    elements
        .map(|el| extract_text(&el))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Visible text of an element, leaving out scripts, styles and page chrome.
fn extract_text(element: &ElementRef) -> String {
    let mut text = String::new();
    collect_text(element, &mut text);
    text
}

fn collect_text(element: &ElementRef, text: &mut String) {
    for child in element.children() {
        if let Some(el) = ElementRef::wrap(child) {
            if !SKIPPED_TAGS.contains(&el.value().name()) {
                collect_text(&el, text);
            }
            continue;
        }
        let Some(t) = child.value().as_text() else {
            continue;
        };
        let trimmed = t.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !text.is_empty() && !text.ends_with(' ') && !text.ends_with('\n') {
            text.push(' ');
        }
        text.push_str(trimmed);
    }
}

/// Collapse runs of spaces and keep at most two consecutive newlines.
fn clean_text(text: &str) -> String {
    let mut result = String::new();
    let mut prev_was_whitespace = false;
    let mut newline_count = 0;

    for ch in text.chars() {
        if ch == '\n' {
            newline_count += 1;
            if newline_count <= 2 {
                result.push('\n');
            }
            prev_was_whitespace = true;
        } else if ch.is_whitespace() {
            if !prev_was_whitespace {
                result.push(' ');
                prev_was_whitespace = true;
            }
            newline_count = 0;
        } else {
            result.push(ch);
            prev_was_whitespace = false;
            newline_count = 0;
        }
    }

    result.trim().to_string()
}

// =============================================================================
// web_search
// =============================================================================

pub struct WebSearchTool {
    client: Client,
    config: WebSearchConfig,
}

impl WebSearchTool {
    pub fn new(config: WebSearchConfig) -> Self {
        Self {
            client: http_client(Duration::from_secs(60)),
            config,
        }
    }

    /// Resolve the configured model names to the search host's provider ids.
    /// Unknown models are left out and the search API picks its defaults.
    async fn model_refs(&self) -> Result<(Option<ModelRef>, Option<ModelRef>), Error> {
        let url = format!("{}/api/providers", self.config.host);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::tool("web_search", format!("Failed to get providers: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::tool(
                "web_search",
                format!("Provider API error: {}", response.status()),
            ));
        }

        let data: ProvidersResponse = response
            .json()
            .await
            .map_err(|e| Error::tool("web_search", format!("Failed to parse providers: {}", e)))?;

        Ok(resolve_models(&data, &self.config))
    }
}

fn resolve_models(
    data: &ProvidersResponse,
    config: &WebSearchConfig,
) -> (Option<ModelRef>, Option<ModelRef>) {
    (
        find_model(data, &config.chat_model, false),
        find_model(data, &config.embed_model, true),
    )
}

fn find_model(data: &ProvidersResponse, wanted: &str, embedding: bool) -> Option<ModelRef> {
    data.providers.iter().find_map(|provider| {
        let models = if embedding {
            &provider.embedding_models
        } else {
            &provider.chat_models
        };
        models.iter().find(|m| m.name == wanted).map(|m| ModelRef {
            provider_id: provider.id.clone(),
            key: m.key.clone(),
        })
    })
}

#[derive(Deserialize)]
struct ProvidersResponse {
    providers: Vec<SearchProvider>,
}

#[derive(Deserialize)]
struct SearchProvider {
    id: String,
    #[serde(rename = "chatModels", default)]
    chat_models: Vec<Model>,
    #[serde(rename = "embeddingModels", default)]
    embedding_models: Vec<Model>,
}

#[derive(Deserialize)]
struct Model {
    name: String,
    key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ModelRef {
    #[serde(rename = "providerId")]
    provider_id: String,
    key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    chat_model: Option<ModelRef>,
    embedding_model: Option<ModelRef>,
    optimization_mode: String,
    sources: Vec<String>,
    query: String,
    history: Vec<(String, String)>,
    system_instructions: String,
    stream: bool,
}

#[derive(Deserialize)]
struct SearchResponse {
    message: String,
    #[serde(default)]
    sources: Vec<SearchSource>,
}

#[derive(Deserialize)]
struct SearchSource {
    metadata: SourceMetadata,
}

#[derive(Deserialize)]
struct SourceMetadata {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
}

fn search_result(response: SearchResponse) -> Value {
    let sources: Vec<Value> = response
        .sources
        .into_iter()
        .map(|s| json!({ "title": s.metadata.title, "url": s.metadata.url }))
        .collect();
    json!({ "answer": response.message, "sources": sources })
}

#[derive(Deserialize)]
struct WebSearchArgs {
    query: String,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web using natural language queries. Returns a synthesized answer with sources."
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new().add_property(
                "query",
                PropertySchema::string("The search query (can be natural language)"),
                true,
            ),
        )
    }

    async fn execute(&self, arguments: Value) -> Result<Value, Error> {
        let args: WebSearchArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::tool("web_search", format!("Invalid arguments: {}", e)))?;

        let (chat_model, embedding_model) = self.model_refs().await?;

        let request = SearchRequest {
            chat_model,
            embedding_model,
            optimization_mode: "speed".to_string(),
            sources: vec!["web".to_string()],
            query: args.query.clone(),
            history: Vec::new(),
            system_instructions: "Provide high level details.".to_string(),
            stream: false,
        };

        let url = format!("{}/api/search", self.config.host);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::tool("web_search", format!("Search request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::tool(
                "web_search",
                format!("Search API error {}: {}", status, body),
            ));
        }

        let result: SearchResponse = response.json().await.map_err(|e| {
            Error::tool("web_search", format!("Failed to parse search response: {}", e))
        })?;
        debug!(query = %args.query, sources = result.sources.len(), "Search finished");

        Ok(search_result(result))
    }
}

/// Web tools for the registry; `web_search` only when a search host is set.
pub fn create_web_tools(search: Option<WebSearchConfig>) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = vec![Arc::new(FetchWebpageTool::new())];
    if let Some(config) = search {
        tools.push(Arc::new(WebSearchTool::new(config)));
    }
    tools
}
