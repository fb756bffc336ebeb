//! Tool catalog contract and the file-backed catalog the binary uses.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

const FUNCTION_PREFIX: &str = "tool_";

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Option<Value>,
}

impl ToolDescriptor {
    /// Name the model sees; `tool_id_from_function_name` reverses it.
    pub fn function_name(&self) -> String {
        format!("{FUNCTION_PREFIX}{}", self.id)
    }

    pub fn function_description(&self) -> String {
        format!("{}:{}", self.name, self.description)
    }
}

pub fn tool_id_from_function_name(name: &str) -> Option<&str> {
    name.strip_prefix(FUNCTION_PREFIX).filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    pub name: String,
    pub content: String,
}

/// What a catalog reports for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
    pub error_message: Option<String>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error_message: Some(message.into()),
        }
    }
}

/// Result of one tool call in one round.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub tool_call_id: String,
    pub success: bool,
    pub output: String,
    pub error_message: Option<String>,
}

impl ToolExecutionResult {
    pub fn from_outcome(tool_call_id: impl Into<String>, outcome: ToolOutcome) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: outcome.success,
            output: outcome.output,
            error_message: outcome.error_message,
        }
    }

    pub fn failed(tool_call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from_outcome(tool_call_id, ToolOutcome::failed(message))
    }

    /// Text reported back to the model for this call.
    pub fn message_content(&self) -> String {
        if self.success {
            return self.output.clone();
        }
        match (&self.error_message, self.output.is_empty()) {
            (Some(message), true) => format!("Error: {message}"),
            (Some(message), false) => format!("Error: {message}\n{}", self.output),
            (None, false) => format!("Error: {}", self.output),
            (None, true) => String::from("Error: tool execution failed"),
        }
    }
}

/// Resolves tools for a group and executes them. Implementations must be
/// safe for concurrent use across requests and must never panic out of
/// `execute`: every failure becomes a failed `ToolOutcome`.
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    async fn tools(&self, group_id: &str) -> Vec<ToolDescriptor>;

    async fn resources(&self, _group_id: &str) -> Vec<ResourceDescriptor> {
        Vec::new()
    }

    async fn execute(&self, tool_id: &str, arguments: Map<String, Value>) -> ToolOutcome;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(flatten)]
    pub kind: ToolKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolKind {
    Http {
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<String>,
    },
    /// Returns the content of the resource named by the `resource_name` argument.
    Resource,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceEntry {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub group_ids: Vec<String>,
}

/// Catalog loaded once from a JSON document and read-only afterwards.
pub struct StaticToolCatalog {
    file: CatalogFile,
    http: reqwest::Client,
}

impl StaticToolCatalog {
    pub fn new(file: CatalogFile) -> Self {
        Self {
            file,
            http: reqwest::Client::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(CatalogFile::default())
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        let catalog = Self::from_json(&json)?;
        info!(
            "Loaded tool catalog from {}: {} tools, {} resources",
            path.display(),
            catalog.file.tools.len(),
            catalog.file.resources.len()
        );
        Ok(catalog)
    }

    async fn execute_http(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&str>,
        arguments: &Map<String, Value>,
    ) -> ToolOutcome {
        let mut request = match method.to_ascii_uppercase().as_str() {
            "GET" => self.http.get(url).query(&query_pairs(arguments)),
            "DELETE" => self.http.delete(url).query(&query_pairs(arguments)),
            "POST" => with_body(self.http.post(url), body, arguments),
            "PUT" => with_body(self.http.put(url), body, arguments),
            other => return ToolOutcome::failed(format!("Unsupported HTTP method: {other}")),
        };
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return ToolOutcome::failed(format!("HTTP tool execution failed: {e}")),
        };
        let status = response.status();
        match response.text().await {
            Ok(text) if status.is_success() => ToolOutcome::ok(text),
            Ok(text) => ToolOutcome {
                success: false,
                output: text,
                error_message: Some(format!("HTTP tool returned status {status}")),
            },
            Err(e) => ToolOutcome::failed(format!("HTTP tool response unreadable: {e}")),
        }
    }

    fn execute_resource(&self, arguments: &Map<String, Value>) -> ToolOutcome {
        let Some(name) = arguments.get("resource_name").and_then(Value::as_str) else {
            return ToolOutcome::failed("Missing 'resource_name' argument");
        };
        match self.file.resources.iter().find(|r| r.name == name) {
            Some(resource) => ToolOutcome::ok(resource.content.clone()),
            None => ToolOutcome::failed(format!("Resource not found with name: {name}")),
        }
    }
}

#[async_trait]
impl ToolCatalog for StaticToolCatalog {
    async fn tools(&self, group_id: &str) -> Vec<ToolDescriptor> {
        self.file
            .tools
            .iter()
            .filter(|tool| tool.group_ids.iter().any(|g| g == group_id))
            .map(|tool| ToolDescriptor {
                id: tool.id.clone(),
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect()
    }

    async fn resources(&self, group_id: &str) -> Vec<ResourceDescriptor> {
        self.file
            .resources
            .iter()
            .filter(|resource| resource.group_ids.iter().any(|g| g == group_id))
            .map(|resource| ResourceDescriptor {
                name: resource.name.clone(),
                content: resource.content.clone(),
            })
            .collect()
    }

    async fn execute(&self, tool_id: &str, arguments: Map<String, Value>) -> ToolOutcome {
        let Some(tool) = self.file.tools.iter().find(|tool| tool.id == tool_id) else {
            warn!("Tool {} not found in catalog", tool_id);
            return ToolOutcome::failed("Tool not found.");
        };
        match &tool.kind {
            ToolKind::Http {
                method,
                url,
                headers,
                body,
            } => {
                self.execute_http(method, url, headers, body.as_deref(), &arguments)
                    .await
            }
            ToolKind::Resource => self.execute_resource(&arguments),
        }
    }
}

fn query_pairs(arguments: &Map<String, Value>) -> Vec<(String, String)> {
    arguments
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), value))
        })
        .collect()
}

fn with_body(
    request: reqwest::RequestBuilder,
    body: Option<&str>,
    arguments: &Map<String, Value>,
) -> reqwest::RequestBuilder {
    match body.filter(|b| !b.is_empty()) {
        Some(template) => request
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(template.to_string()),
        None => request.json(arguments),
    }
}
