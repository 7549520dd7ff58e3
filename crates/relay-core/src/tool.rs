use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::Error;
use crate::message::ToolCall;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ToolParameters,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: ToolParameters::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: ToolParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

/// JSON schema of a tool's argument object.
///
/// Properties are kept sorted so catalogs rendered into prompts are stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(rename = "additionalProperties", default)]
    pub additional_properties: bool,
}

impl Default for ToolParameters {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: false,
        }
    }
}

impl ToolParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_property(
        mut self,
        name: impl Into<String>,
        schema: PropertySchema,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), schema);
        if required {
            self.required.push(name);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PropertySchema {
    pub fn string(description: impl Into<String>) -> Self {
        Self {
            schema_type: "string".to_string(),
            description: Some(description.into()),
        }
    }
}

/// An asynchronous capability the model can invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    /// Run the tool. Any JSON value is a valid result; failures are reported
    /// through `Err` and turned into an in-band `{"error": ...}` by the caller.
    async fn execute(&self, arguments: Value) -> Result<Value, Error>;
}

/// Read-only catalog of tools, shared by reference across requests.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        for tool in tools {
            self.register(tool);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

/// Outcome of one tool invocation, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: String,
    pub result: Value,
    pub execution_time_ms: u64,
}

impl ToolExecutionResult {
    pub fn is_error(&self) -> bool {
        self.result.get("error").is_some()
    }

    /// The call this result answers, as it was extracted from the stream.
    pub fn tool_call(&self) -> ToolCall {
        ToolCall::new(&self.tool_call_id, &self.tool_name, &self.arguments)
    }

    /// JSON text of `result`, as fed back to the backend.
    pub fn result_json(&self) -> String {
        serde_json::to_string(&self.result).unwrap_or_else(|_| "null".to_string())
    }
}

fn error_value(message: impl std::fmt::Display) -> Value {
    json!({ "error": message.to_string() })
}

/// Execute a single tool call, racing it against `timeout`.
///
/// Never fails: unknown tools, bad arguments, tool errors and timeouts all
/// become an `{"error": ...}` result. A timed-out future is dropped.
pub async fn execute_tool_call(
    registry: &ToolRegistry,
    call: &ToolCall,
    timeout: Duration,
) -> ToolExecutionResult {
    let started = Instant::now();

    let result = match registry.get(&call.name) {
        None => error_value(format!("Unknown tool '{}'", call.name)),
        Some(tool) => match call.parse_arguments() {
            Err(Error::Tool { message, .. }) => error_value(message),
            Err(e) => error_value(e),
            Ok(arguments) => {
                debug!(tool = %call.name, id = %call.id, "Executing tool");
                match tokio::time::timeout(timeout, tool.execute(arguments)).await {
                    Ok(Ok(value)) => value,
                    Ok(Err(e)) => {
                        warn!(tool = %call.name, error = %e, "Tool execution failed");
                        error_value(e)
                    }
                    Err(_) => {
                        warn!(tool = %call.name, timeout_ms = timeout.as_millis() as u64, "Tool execution timed out");
                        error_value(format!(
                            "Tool '{}' timed out after {}ms",
                            call.name,
                            timeout.as_millis()
                        ))
                    }
                }
            }
        },
    };

    ToolExecutionResult {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        arguments: call.arguments.clone(),
        result,
        execution_time_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FnTool;

    fn registry() -> ToolRegistry {
        ToolRegistry::new().with_tools([
            FnTool::new("echo", |args| Ok(args)).into_arc(),
            FnTool::new("fail", |_| Err(Error::tool("fail", "exploded"))).into_arc(),
            FnTool::pending("hang").into_arc(),
        ])
    }

    #[test]
    fn test_tool_definition() {
        let def = ToolDefinition::new("fetch_webpage", "Fetch a page").with_parameters(
            ToolParameters::new()
                .add_property("url", PropertySchema::string("Page URL"), true)
                .add_property("selector", PropertySchema::string("CSS selector"), false),
        );

        assert_eq!(def.name, "fetch_webpage");
        assert_eq!(def.parameters.required, vec!["url".to_string()]);
        let keys: Vec<_> = def.parameters.properties.keys().cloned().collect();
        assert_eq!(keys, vec!["selector".to_string(), "url".to_string()]);
    }

    #[test]
    fn test_registry_is_sorted() {
        let reg = registry();
        assert_eq!(reg.names(), vec!["echo", "fail", "hang"]);
        assert_eq!(reg.len(), 3);
        assert!(reg.get("echo").is_some());
        assert!(reg.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_execute_success() {
        let call = ToolCall::new("c1", "echo", r#"{"q":"x"}"#);
        let result = execute_tool_call(&registry(), &call, Duration::from_secs(1)).await;
        assert_eq!(result.result, json!({"q": "x"}));
        assert_eq!(result.tool_call_id, "c1");
        assert_eq!(result.arguments, r#"{"q":"x"}"#);
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn test_execute_failure_is_in_band() {
        let call = ToolCall::new("c2", "fail", "{}");
        let result = execute_tool_call(&registry(), &call, Duration::from_secs(1)).await;
        assert!(result.is_error());
        assert!(result.result["error"].as_str().unwrap().contains("exploded"));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let call = ToolCall::new("c3", "nope", "{}");
        let result = execute_tool_call(&registry(), &call, Duration::from_secs(1)).await;
        assert_eq!(result.result, json!({"error": "Unknown tool 'nope'"}));
    }

    #[tokio::test]
    async fn test_execute_invalid_arguments() {
        let call = ToolCall::new("c4", "echo", "{not json");
        let result = execute_tool_call(&registry(), &call, Duration::from_secs(1)).await;
        assert!(result.result["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid arguments"));
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let call = ToolCall::new("c5", "hang", "{}");
        let started = Instant::now();
        let result = execute_tool_call(&registry(), &call, Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(result.result["error"].as_str().unwrap().contains("timed out"));
    }
}
