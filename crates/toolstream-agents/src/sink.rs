use tokio::sync::mpsc;
use toolstream_common::ToolCall;

/// Receives everything an exchange produces, in order. Called from the exchange task, so
/// implementations should not block.
pub trait OutputSink: Send + Sync {
    fn on_text(&self, text: &str);

    fn on_tool_call(&self, call: &ToolCall);

    fn on_tool_result(&self, name: &str, payload: &str);

    /// Fired once per exchange, after the final assistant message is in history.
    fn on_complete(&self);

    fn on_error(&self, reason: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Text(String),
    ToolCall(ToolCall),
    ToolResult { name: String, payload: String },
    Complete,
    Error(String),
}

/// Forwards sink callbacks into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        // receiver gone means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

impl OutputSink for ChannelSink {
    fn on_text(&self, text: &str) {
        self.send(SinkEvent::Text(text.to_string()));
    }

    fn on_tool_call(&self, call: &ToolCall) {
        self.send(SinkEvent::ToolCall(call.clone()));
    }

    fn on_tool_result(&self, name: &str, payload: &str) {
        self.send(SinkEvent::ToolResult {
            name: name.to_string(),
            payload: payload.to_string(),
        });
    }

    fn on_complete(&self) {
        self.send(SinkEvent::Complete);
    }

    fn on_error(&self, reason: &str) {
        self.send(SinkEvent::Error(reason.to_string()));
    }
}
