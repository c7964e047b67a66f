pub mod delta;
pub mod dispatch;
pub mod manager;
pub mod merge;
pub mod normalize;
pub mod request;
pub mod session;
pub mod sink;
pub mod sse;
pub mod tools;
pub mod transport;

pub use delta::{TurnBuffer, TurnStep};
pub use dispatch::ToolDispatcher;
pub use manager::SessionManager;
pub use merge::{ArgumentPiece, FragmentMerger, ToolCallFragment};
pub use normalize::normalize_arguments;
pub use request::ChatRequest;
pub use session::{EngineContext, Exchange, Session, SessionGuard, SessionState};
pub use sink::{ChannelSink, OutputSink, SinkEvent};
pub use sse::{FrameParser, FramedEvent};
pub use tools::{
    BlockingExecutor, StaticToolRegistry, Tool, ToolBox, ToolError, ToolExecutor, ToolRegistry,
};
pub use transport::{HttpTransport, LineStream, Transport};
