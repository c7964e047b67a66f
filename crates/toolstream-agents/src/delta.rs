use serde_json::Value;
use toolstream_common::{Error, Result};
use tracing::{debug, warn};

use crate::sse::FramedEvent;

pub const DONE: &str = "[DONE]";

const INFORMATIONAL_EVENTS: [&str; 2] = ["tool_status", "tool_complete"];

/// What one frame contributed to the current turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStep {
    /// A text increment to forward right away.
    Text(String),
    /// Tool-call fragments were cached for the merger.
    Buffered,
    /// Nothing usable: informational, unrecognized, or after the terminal marker.
    Ignored,
    /// End of turn.
    Terminal,
}

/// Per-turn accumulator fed by the controller, one frame at a time.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    text: String,
    fragments: Vec<Value>,
    terminated: bool,
}

impl TurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn accept(&mut self, event: &FramedEvent) -> Result<TurnStep> {
        if self.terminated {
            debug!("frame after end of turn ignored");
            return Ok(TurnStep::Ignored);
        }

        let data = event.data.trim();
        if data.is_empty() || data == DONE {
            self.terminated = true;
            return Ok(TurnStep::Terminal);
        }

        if INFORMATIONAL_EVENTS.contains(&event.event_type.as_str()) {
            debug!(event_type = %event.event_type, data = %event.data, "informational frame");
            return Ok(TurnStep::Ignored);
        }

        let payload: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("skipping non-JSON frame: {e}");
                return Ok(TurnStep::Ignored);
            }
        };
        if !payload.is_object() {
            warn!("skipping non-object frame: {data}");
            return Ok(TurnStep::Ignored);
        }
        if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
            return Err(Error::Transport(format!("upstream error: {}", describe_error(err))));
        }

        let Some(delta) = delta_object(&payload) else {
            warn!("skipping frame without a delta object");
            return Ok(TurnStep::Ignored);
        };

        let has_tool_calls = delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .is_some_and(|calls| !calls.is_empty());
        let text = delta
            .get("content")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        if has_tool_calls {
            self.fragments.push(payload.clone());
        }
        match text {
            Some(text) => {
                self.text.push_str(&text);
                Ok(TurnStep::Text(text))
            }
            None if has_tool_calls => Ok(TurnStep::Buffered),
            None => {
                let recognized = delta.get("content").is_some()
                    || delta.get("role").is_some()
                    || delta.as_object().is_some_and(|m| m.is_empty());
                if !recognized {
                    warn!("skipping frame with neither text nor tool calls: {data}");
                }
                Ok(TurnStep::Ignored)
            }
        }
    }

    /// Accumulated text and the cached tool-call frames, in arrival order.
    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.text, self.fragments)
    }
}

/// `choices[0].delta` for chat-completion chunks, the object itself otherwise.
pub fn delta_object(payload: &Value) -> Option<&Value> {
    match payload.get("choices") {
        Some(Value::Array(choices)) => choices.first().and_then(|c| c.get("delta")),
        _ => Some(payload),
    }
}

fn describe_error(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
        other => other.to_string(),
    }
}
