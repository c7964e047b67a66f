use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value, json};
use toolstream_agents::{
    BlockingExecutor, ChannelSink, ChatRequest, EngineContext, LineStream, OutputSink, Session,
    SessionManager, SessionState, SinkEvent, StaticToolRegistry, ToolError, ToolExecutor,
    Transport,
};
use toolstream_common::{Error, ErrorKind, Result, Role, SessionId, ToolCall, ToolDescriptor};
use toolstream_config::EngineConfig;
use tokio::sync::mpsc::UnboundedReceiver;

enum Script {
    Lines(Vec<String>),
    FailAfter(Vec<String>, String),
    Hang(Vec<String>),
    Refuse(String),
}

struct Closed(Arc<AtomicUsize>);

impl Drop for Closed {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<Value>>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        })
    }

    fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, request: &ChatRequest) -> Result<LineStream> {
        self.requests
            .lock()
            .unwrap()
            .push(serde_json::to_value(request).unwrap());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Transport("script exhausted".into()))?;

        let lines = |lines: Vec<String>| stream::iter(lines.into_iter().map(Ok::<String, Error>));
        let stream: LineStream = match script {
            Script::Lines(l) => lines(l).boxed(),
            Script::FailAfter(l, reason) => lines(l)
                .chain(stream::once(async move { Err(Error::Transport(reason)) }))
                .boxed(),
            Script::Hang(l) => lines(l).chain(stream::pending()).boxed(),
            Script::Refuse(reason) => return Err(Error::Transport(reason)),
        };

        let guard = Closed(Arc::clone(&self.closed));
        Ok(stream
            .map(move |line| {
                let _open = &guard;
                line
            })
            .boxed())
    }
}

fn frames(payloads: &[Value]) -> Vec<String> {
    payloads
        .iter()
        .flat_map(|p| {
            let data = match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            [format!("data: {data}"), String::new()]
        })
        .collect()
}

fn text(content: &str) -> Value {
    json!({"choices": [{"index": 0, "delta": {"content": content}}]})
}

fn tool(index: u64, id: Option<&str>, name: Option<&str>, args: &str) -> Value {
    let mut call = json!({"index": index, "function": {"arguments": args}});
    if let Some(id) = id {
        call["id"] = json!(id);
        call["type"] = json!("function");
    }
    if let Some(name) = name {
        call["function"]["name"] = json!(name);
    }
    json!({"choices": [{"index": 0, "delta": {"tool_calls": [call]}}]})
}

fn done() -> Value {
    json!("[DONE]")
}

fn session(transport: Arc<ScriptedTransport>, tools: &[&str], max_turns: usize) -> Session {
    let executor = BlockingExecutor::new(|name, args| match name {
        "get_weather" => Ok(json!({"city": args.get("city").cloned(), "sky": "sunny"})),
        "echo" => Ok(args.get("text").cloned().unwrap_or(Value::Null)),
        _ => Err(ToolError::Execution(format!("{name} exploded"))),
    });
    let registry = StaticToolRegistry::new(
        tools
            .iter()
            .map(|name| ToolDescriptor::new(*name, "test tool", Value::Null))
            .collect(),
    );
    let config = EngineConfig {
        max_turns,
        ..EngineConfig::default()
    };
    let context = EngineContext::new(config, transport, Arc::new(registry), Arc::new(executor));
    Session::new(SessionId::new(), Arc::new(context))
}

fn drain(rx: &mut UnboundedReceiver<SinkEvent>) -> Vec<SinkEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_for_requests(transport: &ScriptedTransport, count: usize) {
    for _ in 0..200 {
        if transport.requests().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("transport never saw {count} requests");
}

#[tokio::test]
async fn plain_text_turn_completes() {
    let transport = ScriptedTransport::new(vec![Script::Lines(frames(&[
        text("Hel"),
        text("lo"),
        done(),
    ]))]);
    let session = session(transport.clone(), &[], 10);
    let (sink, mut rx) = ChannelSink::new();

    session.send_prompt("hi", Arc::new(sink)).unwrap().wait().await.unwrap();

    assert_eq!(
        drain(&mut rx),
        vec![
            SinkEvent::Text("Hel".into()),
            SinkEvent::Text("lo".into()),
            SinkEvent::Complete
        ]
    );
    let history = session.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].text(), "Hello");
    assert_eq!(session.state(), SessionState::Completed);
    assert!(!session.is_busy());
    assert_eq!(transport.closed(), 1);
}

#[tokio::test]
async fn tool_round_trip_continues_the_conversation() {
    let transport = ScriptedTransport::new(vec![
        Script::Lines(frames(&[
            tool(0, Some("call_1"), Some("get_weather"), ""),
            tool(0, None, None, "{\"ci"),
            tool(0, None, None, "ty\": \"Paris\"}"),
            done(),
        ])),
        Script::Lines(frames(&[text("It is sunny in Paris."), done()])),
    ]);
    let session = session(transport.clone(), &["get_weather"], 10);
    let (sink, mut rx) = ChannelSink::new();

    session
        .send_prompt("weather in Paris?", Arc::new(sink))
        .unwrap()
        .wait()
        .await
        .unwrap();

    let events = drain(&mut rx);
    assert_eq!(events.len(), 4);
    let SinkEvent::ToolCall(call) = &events[0] else {
        panic!("expected tool call, got {:?}", events[0]);
    };
    assert_eq!(call.id, "call_1");
    assert_eq!(call.arguments["city"], json!("Paris"));
    assert_eq!(
        events[1],
        SinkEvent::ToolResult {
            name: "get_weather".into(),
            payload: r#"{"city":"Paris","sky":"sunny"}"#.into()
        }
    );
    assert_eq!(events[2], SinkEvent::Text("It is sunny in Paris.".into()));
    assert_eq!(events[3], SinkEvent::Complete);

    let history = session.history();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert!(history[1].content.is_none());
    assert_eq!(history[1].tool_calls[0].function, "get_weather");
    assert_eq!(history[2].tool_call_id.as_deref(), Some("call_1"));

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["tools"][0]["function"]["name"], json!("get_weather"));
    assert_eq!(
        requests[1]["messages"][1]["tool_calls"][0]["function"]["arguments"],
        json!("{\"city\":\"Paris\"}")
    );
    assert_eq!(requests[1]["messages"][2]["role"], json!("tool"));
}

#[tokio::test]
async fn second_prompt_while_busy_is_rejected_without_side_effects() {
    let transport = ScriptedTransport::new(vec![Script::Hang(frames(&[text("thinking")]))]);
    let session = session(transport.clone(), &[], 10);
    let (sink, mut rx) = ChannelSink::new();
    let sink = Arc::new(sink);

    let exchange = session.send_prompt("first", sink.clone()).unwrap();
    let err = session.send_prompt("second", sink.clone()).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(session.history().len(), 1);
    assert_eq!(session.history()[0].text(), "first");

    wait_for_requests(&transport, 1).await;
    session.cancel();
    let outcome = exchange.wait().await;
    assert!(matches!(outcome, Err(Error::Cancelled)));
    assert_eq!(session.state(), SessionState::Cancelled);
    assert_eq!(transport.closed(), 1);

    // no completion after cancel
    assert!(!drain(&mut rx).contains(&SinkEvent::Complete));
    let err = session.send_prompt("third", sink).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn missing_tool_becomes_error_result_and_session_continues() {
    let transport = ScriptedTransport::new(vec![
        Script::Lines(frames(&[
            tool(0, Some("call_x"), Some("launch_rocket"), "{}"),
            done(),
        ])),
        Script::Lines(frames(&[text("That tool is unavailable."), done()])),
    ]);
    let session = session(transport.clone(), &["echo", "get_weather"], 10);
    let (sink, mut rx) = ChannelSink::new();

    session.send_prompt("launch", Arc::new(sink)).unwrap().wait().await.unwrap();

    let history = session.history();
    assert_eq!(
        history[2].text(),
        "tool not found: launch_rocket, available: echo, get_weather"
    );
    assert_eq!(history[3].text(), "That tool is unavailable.");
    assert_eq!(transport.requests().len(), 2);
    assert_eq!(session.state(), SessionState::Completed);
    assert!(drain(&mut rx).contains(&SinkEvent::Complete));
}

#[tokio::test]
async fn frames_after_done_are_ignored() {
    let transport = ScriptedTransport::new(vec![Script::Lines(frames(&[
        text("once"),
        done(),
        text("ghost"),
        done(),
    ]))]);
    let session = session(transport, &[], 10);
    let (sink, mut rx) = ChannelSink::new();

    session.send_prompt("go", Arc::new(sink)).unwrap().wait().await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(events, vec![SinkEvent::Text("once".into()), SinkEvent::Complete]);
    assert_eq!(session.history()[1].text(), "once");
}

#[tokio::test]
async fn text_order_survives_interleaved_tool_frames() {
    let transport = ScriptedTransport::new(vec![
        Script::Lines(frames(&[
            text("Let me "),
            tool(0, Some("call_1"), Some("echo"), "{\"text\":"),
            text("check. "),
            tool(0, None, None, "\"ping\"}"),
            text("One moment."),
            done(),
        ])),
        Script::Lines(frames(&[text("Got ping."), done()])),
    ]);
    let session = session(transport, &["echo"], 10);
    let (sink, mut rx) = ChannelSink::new();

    session.send_prompt("echo ping", Arc::new(sink)).unwrap().wait().await.unwrap();

    let texts: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            SinkEvent::Text(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["Let me ", "check. ", "One moment.", "Got ping."]);

    let history = session.history();
    assert_eq!(history[1].text(), "Let me check. One moment.");
    assert_eq!(history[1].tool_calls.len(), 1);
    assert_eq!(history[2].text(), "ping");
}

#[tokio::test]
async fn stream_closed_without_done_ends_the_turn() {
    let transport = ScriptedTransport::new(vec![Script::Lines(vec![
        "data: {\"content\":\"partial\"}".to_string(),
    ])]);
    let session = session(transport, &[], 10);
    let (sink, mut rx) = ChannelSink::new();

    session.send_prompt("go", Arc::new(sink)).unwrap().wait().await.unwrap();

    assert_eq!(
        drain(&mut rx),
        vec![SinkEvent::Text("partial".into()), SinkEvent::Complete]
    );
}

#[tokio::test]
async fn transport_failure_errors_the_session_but_allows_retry() {
    let transport = ScriptedTransport::new(vec![
        Script::FailAfter(frames(&[text("half")]), "connection reset".into()),
        Script::Lines(frames(&[text("recovered"), done()])),
    ]);
    let session = session(transport.clone(), &[], 10);
    let (sink, mut rx) = ChannelSink::new();
    let sink = Arc::new(sink);

    let err = session.send_prompt("one", sink.clone()).unwrap().wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportFailure);
    assert_eq!(session.state(), SessionState::Errored);
    let events = drain(&mut rx);
    assert_eq!(events[0], SinkEvent::Text("half".into()));
    assert!(matches!(&events[1], SinkEvent::Error(reason) if reason.contains("connection reset")));

    session.send_prompt("two", sink).unwrap().wait().await.unwrap();
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(session.history().last().unwrap().text(), "recovered");
}

#[tokio::test]
async fn refused_request_is_a_transport_failure() {
    let transport = ScriptedTransport::new(vec![Script::Refuse("endpoint returned 401".into())]);
    let session = session(transport, &[], 10);
    let (sink, mut rx) = ChannelSink::new();

    let err = session.send_prompt("hi", Arc::new(sink)).unwrap().wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportFailure);
    assert!(matches!(&drain(&mut rx)[..], [SinkEvent::Error(reason)] if reason.contains("401")));
}

#[tokio::test]
async fn upstream_error_payload_fails_the_turn() {
    let transport = ScriptedTransport::new(vec![Script::Lines(frames(&[
        json!({"error": {"message": "model overloaded"}}),
    ]))]);
    let session = session(transport, &[], 10);
    let (sink, _rx) = ChannelSink::new();

    let err = session.send_prompt("hi", Arc::new(sink)).unwrap().wait().await.unwrap_err();
    assert!(err.to_string().contains("model overloaded"));
    assert_eq!(session.state(), SessionState::Errored);
}

#[tokio::test]
async fn runaway_tool_loop_hits_turn_limit() {
    let looping = || {
        Script::Lines(frames(&[
            tool(0, Some("call_loop"), Some("echo"), "{\"text\":\"again\"}"),
            done(),
        ]))
    };
    let transport = ScriptedTransport::new(vec![looping(), looping(), looping()]);
    let session = session(transport.clone(), &["echo"], 2);
    let (sink, _rx) = ChannelSink::new();

    let err = session.send_prompt("loop", Arc::new(sink)).unwrap().wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(session.state(), SessionState::Errored);
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test]
async fn manager_routes_prompts_by_session_id() {
    let transport = ScriptedTransport::new(vec![Script::Lines(frames(&[text("hey"), done()]))]);
    let context = EngineContext::new(
        EngineConfig::default(),
        transport,
        Arc::new(StaticToolRegistry::default()),
        Arc::new(BlockingExecutor::new(|_, _| Ok(Value::Null))),
    );
    let manager = SessionManager::new(context);
    let id = SessionId::from("chat-1");
    let (sink, _rx) = ChannelSink::new();

    manager.prompt(&id, "hello", Arc::new(sink)).unwrap().wait().await.unwrap();
    assert_eq!(manager.len(), 1);
    assert_eq!(manager.get(&id).unwrap().history().len(), 2);

    manager.close(&id).unwrap();
    assert!(manager.get(&id).is_none());
    assert!(matches!(manager.close(&id), Err(Error::SessionNotFound(_))));
}

#[tokio::test]
async fn cancel_with_buffered_tool_fragments_discards_them() {
    let transport = ScriptedTransport::new(vec![Script::Hang(frames(&[
        tool(0, Some("call_1"), Some("get_weather"), ""),
        tool(0, None, None, "{\"city\":"),
    ]))]);
    let session = session(transport.clone(), &["get_weather"], 10);
    let (sink, mut rx) = ChannelSink::new();

    let exchange = session.send_prompt("weather?", Arc::new(sink)).unwrap();
    wait_for_requests(&transport, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    session.cancel();

    assert!(matches!(exchange.wait().await, Err(Error::Cancelled)));
    let events = drain(&mut rx);
    assert!(!events.iter().any(|e| matches!(e, SinkEvent::ToolCall(_))), "{events:?}");
    assert!(!events.contains(&SinkEvent::Complete));

    let history = session.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(session.state(), SessionState::Cancelled);
    assert!(!session.is_busy());
    assert_eq!(transport.closed(), 1);
}

struct SlowExecutor {
    started: Arc<AtomicBool>,
}

#[async_trait]
impl ToolExecutor for SlowExecutor {
    async fn invoke(
        &self,
        _name: &str,
        _arguments: &Map<String, Value>,
    ) -> std::result::Result<Value, ToolError> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!("too late"))
    }
}

#[tokio::test]
async fn cancel_while_a_tool_runs_stops_the_exchange() {
    let transport = ScriptedTransport::new(vec![
        Script::Lines(frames(&[
            tool(0, Some("call_1"), Some("echo"), "{\"text\":\"hi\"}"),
            done(),
        ])),
        Script::Lines(frames(&[text("never requested"), done()])),
    ]);
    let started = Arc::new(AtomicBool::new(false));
    let context = EngineContext::new(
        EngineConfig::default(),
        transport.clone(),
        Arc::new(StaticToolRegistry::new(vec![ToolDescriptor::new(
            "echo",
            "test tool",
            Value::Null,
        )])),
        Arc::new(SlowExecutor {
            started: Arc::clone(&started),
        }),
    );
    let session = Session::new(SessionId::new(), Arc::new(context));
    let (sink, mut rx) = ChannelSink::new();

    let exchange = session.send_prompt("echo hi", Arc::new(sink)).unwrap();
    for _ in 0..200 {
        if started.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(started.load(Ordering::SeqCst), "tool never started");
    assert_eq!(session.state(), SessionState::Dispatching);
    session.cancel();

    assert!(matches!(exchange.wait().await, Err(Error::Cancelled)));
    let events = drain(&mut rx);
    assert!(matches!(&events[..], [SinkEvent::ToolCall(call)] if call.id == "call_1"), "{events:?}");
    assert_eq!(session.history().len(), 1);
    assert_eq!(session.state(), SessionState::Cancelled);
    assert!(!session.is_busy());
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(transport.closed(), 1);
}

struct ExplodingSink;

impl OutputSink for ExplodingSink {
    fn on_text(&self, _text: &str) {
        panic!("sink exploded");
    }

    fn on_tool_call(&self, _call: &ToolCall) {}

    fn on_tool_result(&self, _name: &str, _payload: &str) {}

    fn on_complete(&self) {}

    fn on_error(&self, _reason: &str) {}
}

#[tokio::test]
async fn panicking_sink_errors_the_exchange_and_frees_the_session() {
    let transport = ScriptedTransport::new(vec![
        Script::Lines(frames(&[text("boom"), done()])),
        Script::Lines(frames(&[text("fine"), done()])),
    ]);
    let session = session(transport, &[], 10);

    let err = session
        .send_prompt("first", Arc::new(ExplodingSink))
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("sink exploded"), "{err}");
    assert_eq!(session.state(), SessionState::Errored);
    assert!(!session.is_busy());

    let (sink, mut rx) = ChannelSink::new();
    session.send_prompt("second", Arc::new(sink)).unwrap().wait().await.unwrap();
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(
        drain(&mut rx),
        vec![SinkEvent::Text("fine".into()), SinkEvent::Complete]
    );
}
