use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::{FutureExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toolstream_common::{Error, Message, Result, SessionId, ToolCall};
use toolstream_config::EngineConfig;
use tracing::{debug, info, instrument, warn};

use crate::delta::{TurnBuffer, TurnStep};
use crate::dispatch::ToolDispatcher;
use crate::merge::FragmentMerger;
use crate::request::ChatRequest;
use crate::sink::OutputSink;
use crate::sse;
use crate::tools::{ToolExecutor, ToolRegistry};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Merging,
    Dispatching,
    Continuing,
    Completed,
    Errored,
    Cancelled,
}

impl SessionState {
    /// Settled states: no exchange is running.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            SessionState::Idle
                | SessionState::Completed
                | SessionState::Errored
                | SessionState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Streaming => "streaming",
            SessionState::Merging => "merging",
            SessionState::Dispatching => "dispatching",
            SessionState::Continuing => "continuing",
            SessionState::Completed => "completed",
            SessionState::Errored => "errored",
            SessionState::Cancelled => "cancelled",
        }
    }
}

/// Single-flight flag: at most one exchange per session.
#[derive(Debug, Default)]
pub struct SessionGuard {
    busy: AtomicBool,
}

impl SessionGuard {
    /// Returns `false` if an exchange already holds the guard.
    pub fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Collaborators shared by every session of an engine.
pub struct EngineContext {
    pub config: EngineConfig,
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<dyn ToolRegistry>,
    pub executor: Arc<dyn ToolExecutor>,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ToolRegistry>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            config,
            transport,
            registry,
            executor,
        }
    }
}

/// One conversation with the remote endpoint. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    context: Arc<EngineContext>,
    history: RwLock<Vec<Message>>,
    state: RwLock<SessionState>,
    guard: SessionGuard,
    cancel: CancellationToken,
}

/// Handle to a running exchange.
pub struct Exchange {
    handle: JoinHandle<Result<()>>,
}

impl Exchange {
    /// Wait for the exchange to settle.
    pub async fn wait(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| Error::Agent(format!("exchange task failed: {e}")))?
    }
}

impl Session {
    pub fn new(id: SessionId, context: Arc<EngineContext>) -> Self {
        let mut history = Vec::new();
        if let Some(prompt) = context.config.system_prompt.as_deref() {
            history.push(Message::system(prompt));
        }
        Self {
            inner: Arc::new(SessionInner {
                id,
                context,
                history: RwLock::new(history),
                state: RwLock::new(SessionState::Idle),
                guard: SessionGuard::default(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn history(&self) -> Vec<Message> {
        self.inner.history_snapshot()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.guard.is_held()
    }

    /// Start an exchange for `text`. Returns immediately; output goes to `sink`.
    ///
    /// Fails with [`Error::Busy`] while another exchange runs, leaving history untouched, and
    /// with [`Error::Cancelled`] once the session was cancelled.
    pub fn send_prompt(&self, text: impl Into<String>, sink: Arc<dyn OutputSink>) -> Result<Exchange> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.inner.guard.try_acquire() {
            return Err(Error::Busy);
        }
        if self.inner.cancel.is_cancelled() {
            self.inner.guard.release();
            return Err(Error::Cancelled);
        }

        self.inner.push(Message::user(text));
        self.inner.set_state(SessionState::Streaming);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(sink).await });
        Ok(Exchange { handle })
    }

    /// Stop the running exchange, if any, and refuse further prompts.
    pub fn cancel(&self) {
        info!(session_id = %self.inner.id, "cancelling session");
        self.inner.cancel.cancel();
        if !self.inner.guard.is_held() {
            self.inner.set_state(SessionState::Cancelled);
        }
    }
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        debug!(session_id = %self.id, from = state.as_str(), to = next.as_str(), "state change");
        *state = next;
    }

    fn history_snapshot(&self) -> Vec<Message> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, message: Message) {
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    fn append_tool_round(&self, text: String, calls: Vec<ToolCall>) {
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        let results: Vec<Message> = calls
            .iter()
            .map(|call| {
                let payload = call.result.as_ref().map(|r| r.payload.clone()).unwrap_or_default();
                Message::tool(call.id.clone(), payload)
            })
            .collect();
        history.push(Message::assistant_with_tools(text, calls));
        history.extend(results);
    }

    async fn run(self: Arc<Self>, sink: Arc<dyn OutputSink>) -> Result<()> {
        // a panicking sink or tool must still settle the session and free the guard
        let outcome = match AssertUnwindSafe(self.drive(sink.as_ref())).catch_unwind().await {
            Ok(Ok(())) if self.cancel.is_cancelled() => Err(Error::Cancelled),
            Ok(outcome) => outcome,
            Err(panic) => Err(Error::Agent(format!(
                "exchange panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        match &outcome {
            Ok(()) => self.set_state(SessionState::Completed),
            Err(Error::Cancelled) => self.set_state(SessionState::Cancelled),
            Err(_) => self.set_state(SessionState::Errored),
        }
        self.guard.release();

        let notify = AssertUnwindSafe(|| match &outcome {
            Ok(()) => sink.on_complete(),
            Err(Error::Cancelled) => info!(session_id = %self.id, "exchange cancelled"),
            Err(e) => {
                warn!(session_id = %self.id, "exchange failed: {e}");
                sink.on_error(&e.to_string());
            }
        });
        if std::panic::catch_unwind(notify).is_err() {
            warn!(session_id = %self.id, "output sink panicked while settling");
        }
        outcome
    }

    #[instrument(skip(self, sink), fields(session_id = %self.id))]
    async fn drive(&self, sink: &dyn OutputSink) -> Result<()> {
        let context = &self.context;
        let max_turns = context.config.max_turns;
        let mut turn = 0;

        loop {
            if turn >= max_turns {
                return Err(Error::Agent(format!(
                    "tool loop did not settle within {max_turns} turns"
                )));
            }
            turn += 1;
            self.set_state(SessionState::Streaming);

            let tools = context.registry.list();
            let request = ChatRequest::build(&context.config, &self.history_snapshot(), &tools)?;
            debug!(turn, tools = tools.len(), "opening turn");

            let lines = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                lines = context.transport.open(&request) => lines?,
            };

            let mut frames = sse::frames(lines);
            let mut buffer = TurnBuffer::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    next = frames.next() => next,
                };
                match next {
                    Some(Ok(event)) => match buffer.accept(&event)? {
                        TurnStep::Text(text) => sink.on_text(&text),
                        TurnStep::Terminal => break,
                        TurnStep::Buffered | TurnStep::Ignored => {}
                    },
                    Some(Err(e)) => return Err(e),
                    None => {
                        debug!(turn, "stream closed without terminal marker");
                        break;
                    }
                }
            }
            drop(frames);

            self.set_state(SessionState::Merging);
            let (text, fragments) = buffer.into_parts();
            let calls = FragmentMerger::merge_frames(&fragments);
            if calls.is_empty() {
                self.push(Message::assistant(text));
                info!(turn, "exchange complete");
                return Ok(());
            }

            self.set_state(SessionState::Dispatching);
            info!(turn, calls = calls.len(), "dispatching tool calls");
            let dispatcher = ToolDispatcher::new(tools, Arc::clone(&context.executor));
            let mut executed = Vec::with_capacity(calls.len());
            for mut call in calls {
                sink.on_tool_call(&call);
                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    result = dispatcher.execute(&call) => result,
                };
                sink.on_tool_result(&call.function, &result.payload);
                call.result = Some(result);
                executed.push(call);
            }

            self.set_state(SessionState::Continuing);
            self.append_tool_round(text, executed);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}
