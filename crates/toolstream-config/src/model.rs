use serde::{Deserialize, Serialize};
use toolstream_common::{Error, Result, ToolDescriptor};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Settings for one engine instance.
///
/// Built once at startup, either by [`crate::ConfigLoader`] or by hand, and handed to the
/// session layer by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chat-completions endpoint that answers with an event stream.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Connect and read timeout applied by the HTTP transport.
    pub timeout_secs: u64,
    /// Upper bound on streaming turns per prompt, counting continuations.
    pub max_turns: usize,
    pub system_prompt: Option<String>,
    /// Base URL of a tool server exposing `api/tools` and `api/tools/execute`.
    pub tool_server_url: Option<String>,
    /// Statically configured tools, advertised in addition to any fetched ones.
    pub tools: Vec<ToolDescriptor>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            timeout_secs: 60,
            max_turns: 10,
            system_prompt: None,
            tool_server_url: None,
            tools: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::Config("endpoint must not be empty".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(Error::Config("model must not be empty".to_string()));
        }
        if self.max_turns == 0 {
            return Err(Error::Config("max_turns must be at least 1".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::Config(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }
        if let Some(tool) = self.tools.iter().find(|t| t.name.trim().is_empty()) {
            return Err(Error::Config(format!(
                "configured tool has an empty name (description: {:?})",
                tool.description
            )));
        }
        Ok(())
    }
}
