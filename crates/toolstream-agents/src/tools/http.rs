use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use toolstream_common::{Error, Result, ToolDescriptor};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::{ToolError, ToolExecutor, ToolRegistry};

const TOOLS_PATH: &str = "api/tools";
const EXECUTE_PATH: &str = "api/tools/execute";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

fn join(base_url: &str, path: &str) -> Result<Url> {
    let mut base = base_url.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base)
        .and_then(|u| u.join(path))
        .map_err(|e| Error::Config(format!("invalid tool server url {base_url:?}: {e}")))
}

fn client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Transport(format!("failed to build http client: {e}")))
}

#[derive(Debug, Deserialize)]
struct RemoteTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<Vec<RemoteParameter>>,
}

#[derive(Debug, Deserialize)]
struct RemoteParameter {
    name: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    required: bool,
}

impl RemoteTool {
    fn into_descriptor(self) -> ToolDescriptor {
        let params = self.parameters.unwrap_or_default();
        let schema = if params.is_empty() {
            Value::Null
        } else {
            let mut properties = Map::new();
            let mut required = Vec::new();
            for param in params {
                let description = param.description.unwrap_or_else(|| param.name.clone());
                properties.insert(
                    param.name.clone(),
                    json!({"type": schema_type(param.kind.as_deref()), "description": description}),
                );
                if param.required {
                    required.push(Value::String(param.name));
                }
            }
            let mut schema = json!({"type": "object", "properties": properties});
            if !required.is_empty() {
                schema["required"] = Value::Array(required);
            }
            schema
        };
        ToolDescriptor::new(self.name, self.description.unwrap_or_default(), schema)
    }
}

fn schema_type(kind: Option<&str>) -> &'static str {
    match kind.map(str::to_ascii_lowercase).as_deref() {
        Some("int" | "integer" | "long") => "integer",
        Some("number" | "double" | "float") => "number",
        Some("bool" | "boolean") => "boolean",
        Some("object" | "map") => "object",
        Some("array" | "list") => "array",
        _ => "string",
    }
}

/// Tool list fetched once from a tool server's `api/tools` endpoint.
#[derive(Debug, Clone, Default)]
pub struct HttpToolCatalog {
    tools: Vec<ToolDescriptor>,
}

impl HttpToolCatalog {
    /// Fetch the catalog. Any failure is logged and yields an empty catalog.
    pub async fn fetch(base_url: &str) -> Self {
        match Self::try_fetch(base_url).await {
            Ok(tools) => {
                info!("fetched {} tools from {base_url}", tools.len());
                Self { tools }
            }
            Err(e) => {
                warn!("could not fetch tools from {base_url}: {e}");
                Self::default()
            }
        }
    }

    async fn try_fetch(base_url: &str) -> Result<Vec<ToolDescriptor>> {
        let url = join(base_url, TOOLS_PATH)?;
        let response = client(DEFAULT_TIMEOUT)?
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("tool list request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("tool list returned {status}")));
        }

        let remote: Vec<RemoteTool> = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("invalid tool list: {e}")))?;
        for tool in &remote {
            debug!(name = %tool.name, "discovered tool");
        }
        Ok(remote.into_iter().map(RemoteTool::into_descriptor).collect())
    }
}

impl ToolRegistry for HttpToolCatalog {
    fn list(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    tool_name: &'a str,
    arguments: &'a Map<String, Value>,
    client_id: &'a str,
}

/// Executes tools by POSTing to a tool server's `api/tools/execute` endpoint.
#[derive(Clone)]
pub struct HttpToolExecutor {
    client: Client,
    url: Url,
    client_id: String,
}

impl HttpToolExecutor {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: client(DEFAULT_TIMEOUT)?,
            url: join(base_url, EXECUTE_PATH)?,
            client_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = client(timeout)?;
        Ok(self)
    }
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn invoke(&self, name: &str, arguments: &Map<String, Value>) -> std::result::Result<Value, ToolError> {
        let body = ExecuteRequest {
            tool_name: name,
            arguments,
            client_id: &self.client_id,
        };
        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::Remote(format!("request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::Remote(format!("failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(ToolError::Remote(format!("{status}: {text}")));
        }

        extract_result(&text)
    }
}

/// Pull the tool result out of a tool server response body.
fn extract_result(body: &str) -> std::result::Result<Value, ToolError> {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return Ok(Value::String(body.to_string()));
    };
    let Value::Object(map) = &parsed else {
        return Ok(parsed);
    };

    if let Some(err) = map.get("error").filter(|e| !e.is_null()) {
        let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return Err(ToolError::Execution(message));
    }
    if let Some(result) = map.get("result").filter(|v| !v.is_null()) {
        return Ok(result.clone());
    }
    if let Some(result) = map.get("response").filter(|v| !v.is_null()) {
        return Ok(result.clone());
    }
    match map.get("data") {
        Some(Value::Object(data)) if data.contains_key("result") => Ok(data["result"].clone()),
        Some(data @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => Ok(data.clone()),
        _ => Ok(Value::String(body.to_string())),
    }
}
