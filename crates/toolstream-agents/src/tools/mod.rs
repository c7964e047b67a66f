pub mod clock;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use toolstream_common::ToolDescriptor;

pub use clock::CurrentTime;
pub use http::{HttpToolCatalog, HttpToolExecutor};

/// Failure raised by a tool implementation. The dispatcher turns it into error-result text.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Execution(String),

    #[error("tool server error: {0}")]
    Remote(String),
}

/// Source of the tool descriptors advertised with each request.
pub trait ToolRegistry: Send + Sync {
    /// Snapshot of the currently registered tools.
    fn list(&self) -> Vec<ToolDescriptor>;
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn invoke(&self, name: &str, arguments: &Map<String, Value>) -> Result<Value, ToolError>;
}

/// Fixed descriptor list, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticToolRegistry {
    tools: Vec<ToolDescriptor>,
}

impl StaticToolRegistry {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }
}

impl ToolRegistry for StaticToolRegistry {
    fn list(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }
}

/// An in-process tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn input_schema(&self) -> Value;

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError>;
}

/// A set of in-process [`Tool`]s, usable as both registry and executor.
#[derive(Clone, Default)]
pub struct ToolBox {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    /// Add a tool, replacing any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    fn find_tool(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }
}

impl ToolRegistry for ToolBox {
    fn list(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|t| ToolDescriptor::new(t.name(), t.description(), t.input_schema()))
            .collect()
    }
}

#[async_trait]
impl ToolExecutor for ToolBox {
    async fn invoke(&self, name: &str, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        match self.find_tool(name) {
            Some(tool) => tool.execute(arguments).await,
            None => Err(ToolError::Execution(format!("unknown tool: {name}"))),
        }
    }
}

type BlockingFn = dyn Fn(&str, &Map<String, Value>) -> Result<Value, ToolError> + Send + Sync;

/// Runs a synchronous executor on tokio's blocking pool so it never stalls the exchange task.
#[derive(Clone)]
pub struct BlockingExecutor {
    inner: Arc<BlockingFn>,
}

impl BlockingExecutor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, &Map<String, Value>) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }
}

#[async_trait]
impl ToolExecutor for BlockingExecutor {
    async fn invoke(&self, name: &str, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        let arguments = arguments.clone();
        tokio::task::spawn_blocking(move || inner(&name, &arguments))
            .await
            .map_err(|e| ToolError::Execution(format!("blocking tool panicked: {e}")))?
    }
}
