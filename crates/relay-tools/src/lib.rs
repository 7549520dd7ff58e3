//! relay-tools: Built-in tools for relay
//!
//! - Web: fetch and parse webpages, search through a Perplexica instance

pub mod web;

use std::sync::Arc;

use relay_core::{Tool, ToolRegistry};

pub use web::{create_web_tools, FetchWebpageTool, WebSearchConfig, WebSearchTool};

/// Registry with the built-in tools enabled by the caller.
pub fn default_registry(enable_web: bool, search: Option<WebSearchConfig>) -> ToolRegistry {
    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    if enable_web {
        tools.extend(create_web_tools(search));
    }
    ToolRegistry::new().with_tools(tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        assert!(default_registry(false, None).is_empty());

        let registry = default_registry(true, Some(WebSearchConfig::new("http://h", "c", "e")));
        assert_eq!(registry.names(), vec!["fetch_webpage", "web_search"]);
        assert!(registry.get("web_search").is_some());
    }
}
