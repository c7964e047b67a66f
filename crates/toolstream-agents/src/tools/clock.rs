use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::{Map, Value, json};

use super::{Tool, ToolError};

/// Reports the current time, optionally shifted by a UTC offset in hours.
pub struct CurrentTime;

#[async_trait]
impl Tool for CurrentTime {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time. Optionally pass utc_offset_hours (e.g. -5 or 5.5)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "utc_offset_hours": {
                    "type": "number",
                    "description": "Offset from UTC in hours, between -12 and 14. Defaults to 0."
                }
            }
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let hours = match arguments.get("utc_offset_hours") {
            None | Some(Value::Null) => 0.0,
            Some(v) => v.as_f64().ok_or_else(|| {
                ToolError::InvalidArguments(format!("utc_offset_hours must be a number, got {v}"))
            })?,
        };
        if !(-12.0..=14.0).contains(&hours) {
            return Err(ToolError::InvalidArguments(format!(
                "utc_offset_hours {hours} is out of range"
            )));
        }

        let offset = FixedOffset::east_opt((hours * 3600.0).round() as i32)
            .ok_or_else(|| ToolError::InvalidArguments(format!("invalid offset {hours}")))?;
        Ok(Value::String(Utc::now().with_timezone(&offset).to_rfc3339()))
    }
}
