use futures::stream::{self, BoxStream, StreamExt};
use toolstream_common::Result;

use crate::transport::LineStream;

pub const DEFAULT_EVENT_TYPE: &str = "message";

/// One dispatched event-stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedEvent {
    pub id: Option<String>,
    pub event_type: String,
    /// Every `data:` line of the frame joined with `\n`.
    pub data: String,
}

impl FramedEvent {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            data: data.into(),
        }
    }

    /// Encode back into wire lines, including the terminating blank line.
    pub fn to_wire(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(id) = &self.id {
            lines.push(format!("id: {id}"));
        }
        if self.event_type != DEFAULT_EVENT_TYPE {
            lines.push(format!("event: {}", self.event_type));
        }
        for line in self.data.split('\n') {
            lines.push(format!("data: {line}"));
        }
        lines.push(String::new());
        lines
    }
}

/// Incremental line-to-frame state machine.
#[derive(Debug, Default)]
pub struct FrameParser {
    id: Option<String>,
    event_type: Option<String>,
    data: String,
    has_data: bool,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line without its terminator. Returns a frame when `line` completes one.
    pub fn push_line(&mut self, line: &str) -> Option<FramedEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.dispatch();
        }

        if let Some(value) = field(line, "data") {
            self.data.push_str(value);
            self.data.push('\n');
            self.has_data = true;
        } else if let Some(value) = field(line, "event") {
            self.event_type = Some(value.to_string());
        } else if let Some(value) = field(line, "id") {
            self.id = Some(value.to_string());
        }
        // comments, retry: and unknown fields are ignored
        None
    }

    /// Flush whatever is pending when the underlying stream closes.
    pub fn finish(&mut self) -> Option<FramedEvent> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<FramedEvent> {
        let id = self.id.take();
        let event_type = self.event_type.take();
        if !self.has_data {
            self.data.clear();
            return None;
        }

        self.has_data = false;
        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }
        Some(FramedEvent {
            id,
            event_type: event_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            data,
        })
    }
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

pub type FrameStream = BoxStream<'static, Result<FramedEvent>>;

/// Turn a line stream into a frame stream. A transport error is yielded once and ends the
/// stream; a clean close flushes the pending frame first.
pub fn frames(lines: LineStream) -> FrameStream {
    let state = (lines, FrameParser::new(), false);
    stream::unfold(state, |(mut lines, mut parser, done)| async move {
        if done {
            return None;
        }
        loop {
            match lines.next().await {
                Some(Ok(line)) => {
                    if let Some(event) = parser.push_line(&line) {
                        return Some((Ok(event), (lines, parser, false)));
                    }
                }
                Some(Err(e)) => return Some((Err(e), (lines, parser, true))),
                None => {
                    return parser
                        .finish()
                        .map(|event| (Ok(event), (lines, parser, true)));
                }
            }
        }
    })
    .boxed()
}
