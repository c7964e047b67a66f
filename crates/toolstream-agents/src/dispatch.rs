use std::sync::Arc;

use serde_json::Value;
use toolstream_common::{ToolCall, ToolDescriptor, ToolResult};
use tracing::{info, warn};

use crate::normalize::normalize_arguments;
use crate::tools::ToolExecutor;

/// Executes merged tool calls against the registry snapshot of one request.
pub struct ToolDispatcher {
    snapshot: Vec<ToolDescriptor>,
    executor: Arc<dyn ToolExecutor>,
}

impl ToolDispatcher {
    pub fn new(snapshot: Vec<ToolDescriptor>, executor: Arc<dyn ToolExecutor>) -> Self {
        Self { snapshot, executor }
    }

    /// Never fails: lookup misses and executor errors come back as error results.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        if !self.snapshot.iter().any(|t| t.name == call.function) {
            let available = self
                .snapshot
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            warn!(tool = %call.function, "tool not registered");
            return ToolResult::error(format!(
                "tool not found: {}, available: {available}",
                call.function
            ));
        }

        let arguments = normalize_arguments(&call.arguments);
        info!(tool = %call.function, id = %call.id, "executing tool");
        match self.executor.invoke(&call.function, &arguments).await {
            Ok(Value::String(text)) => ToolResult::ok(text),
            Ok(value) => ToolResult::ok(value.to_string()),
            Err(e) => {
                warn!(tool = %call.function, "tool failed: {e}");
                ToolResult::error(e.to_string())
            }
        }
    }
}
