use serde::Serialize;
use serde_json::{Value, json};
use toolstream_common::{Message, Result, Role, ToolDescriptor};
use toolstream_config::EngineConfig;

/// Body of one streaming chat-completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl ChatRequest {
    pub fn build(config: &EngineConfig, history: &[Message], tools: &[ToolDescriptor]) -> Result<Self> {
        let messages = history
            .iter()
            .map(WireMessage::from_message)
            .collect::<Result<Vec<_>>>()?;
        let tools: Vec<WireTool> = tools.iter().map(WireTool::from_descriptor).collect();
        let tool_choice = (!tools.is_empty()).then(|| "auto".to_string());

        Ok(Self {
            model: config.model.clone(),
            messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream: true,
            tools,
            tool_choice,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum WireMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl WireMessage {
    fn from_message(message: &Message) -> Result<Self> {
        Ok(match message.role {
            Role::System => WireMessage::System {
                content: message.text().to_string(),
            },
            Role::User => WireMessage::User {
                content: message.text().to_string(),
            },
            Role::Assistant => {
                let tool_calls = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        Ok(WireToolCall {
                            id: call.id.clone(),
                            kind: "function".to_string(),
                            function: WireFunctionCall {
                                name: call.function.clone(),
                                arguments: serde_json::to_string(&call.arguments)?,
                            },
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                WireMessage::Assistant {
                    content: message.content.clone(),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                }
            }
            Role::Tool => WireMessage::Tool {
                tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.text().to_string(),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireFunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: WireFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl WireTool {
    fn from_descriptor(descriptor: &ToolDescriptor) -> Self {
        let parameters = match &descriptor.parameters {
            Value::Null => empty_schema(),
            Value::Object(map) if map.is_empty() => empty_schema(),
            other => other.clone(),
        };
        Self {
            kind: "function".to_string(),
            function: WireFunction {
                name: descriptor.name.clone(),
                description: descriptor.description.clone(),
                parameters,
            },
        }
    }
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}
