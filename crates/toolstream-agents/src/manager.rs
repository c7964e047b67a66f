use std::sync::Arc;

use dashmap::DashMap;
use toolstream_common::{Error, Result, SessionId};
use toolstream_config::EngineConfig;
use tracing::info;

use crate::session::{EngineContext, Exchange, Session};
use crate::sink::OutputSink;
use crate::tools::{
    CurrentTime, HttpToolCatalog, HttpToolExecutor, StaticToolRegistry, ToolBox, ToolExecutor,
    ToolRegistry,
};
use crate::transport::HttpTransport;

/// Owns every live session, keyed by id.
pub struct SessionManager {
    context: Arc<EngineContext>,
    sessions: DashMap<SessionId, Session>,
}

impl SessionManager {
    pub fn new(context: EngineContext) -> Self {
        Self {
            context: Arc::new(context),
            sessions: DashMap::new(),
        }
    }

    /// Wire up the HTTP transport and tools described by `config`.
    ///
    /// With a `tool_server_url` the remote catalog is fetched once and calls go to the server.
    /// Otherwise the built-in tools run in-process. Configured descriptors are advertised in
    /// both cases.
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::from_config(&config)?);

        let (mut tools, executor) = match config.tool_server_url.as_deref() {
            Some(url) => {
                let catalog = HttpToolCatalog::fetch(url).await;
                let executor: Arc<dyn ToolExecutor> = Arc::new(HttpToolExecutor::new(url)?);
                (catalog.list(), executor)
            }
            None => {
                let toolbox = ToolBox::new().with_tool(CurrentTime);
                let tools = toolbox.list();
                let executor: Arc<dyn ToolExecutor> = Arc::new(toolbox);
                (tools, executor)
            }
        };
        for configured in &config.tools {
            if !tools.iter().any(|t| t.name == configured.name) {
                tools.push(configured.clone());
            }
        }
        info!("engine ready with {} tools", tools.len());

        let registry = Arc::new(StaticToolRegistry::new(tools));
        Ok(Self::new(EngineContext::new(config, transport, registry, executor)))
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn create(&self) -> Session {
        let session = Session::new(SessionId::new(), Arc::clone(&self.context));
        self.sessions.insert(session.id().clone(), session.clone());
        session
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Send a prompt to `id`, creating the session on first use.
    pub fn prompt(&self, id: &SessionId, text: impl Into<String>, sink: Arc<dyn OutputSink>) -> Result<Exchange> {
        let session = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| Session::new(id.clone(), Arc::clone(&self.context)))
            .clone();
        session.send_prompt(text, sink)
    }

    /// Cancel and forget a session.
    pub fn close(&self, id: &SessionId) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.cancel();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
