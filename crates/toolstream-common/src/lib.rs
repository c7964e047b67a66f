pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use message::{Message, Role, ToolCall, ToolDescriptor, ToolResult, ToolStatus};
pub use types::SessionId;
