use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use toolstream_common::{Error, Result};
use toolstream_config::EngineConfig;
use tracing::debug;

use crate::request::ChatRequest;

/// Lines of an open response, terminators removed. Dropping the stream closes the connection.
pub type LineStream = BoxStream<'static, Result<String>>;

/// Opens one streaming request per turn.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &ChatRequest) -> Result<LineStream>;
}

/// Event-stream transport over reqwest.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(
            config.endpoint.clone(),
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &ChatRequest) -> Result<LineStream> {
        debug!(
            endpoint = %self.endpoint,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "opening stream"
        );

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "text/event-stream")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {key}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("endpoint returned {status}: {body}")));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Transport(format!("stream read failed: {e}"))))
            .boxed();
        Ok(decode_lines(bytes))
    }
}

/// Splits a byte stream on `\n`. A trailing `\r` is removed and invalid UTF-8 is replaced
/// rather than rejected. Bytes are buffered until a full line is available, so multi-byte
/// characters split across chunks decode intact.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(to_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Remaining unterminated bytes, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        Some(to_line(&raw))
    }
}

fn to_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

pub fn decode_lines(bytes: BoxStream<'static, Result<Bytes>>) -> LineStream {
    let state = (bytes, LineDecoder::new(), false);
    stream::unfold(state, |(mut bytes, mut decoder, done)| async move {
        if done {
            return None;
        }
        match bytes.next().await {
            Some(Ok(chunk)) => {
                let lines: Vec<Result<String>> = decoder.push(&chunk).into_iter().map(Ok).collect();
                Some((stream::iter(lines), (bytes, decoder, false)))
            }
            Some(Err(e)) => Some((stream::iter(vec![Err(e)]), (bytes, decoder, true))),
            None => {
                let tail: Vec<Result<String>> = decoder.finish().into_iter().map(Ok).collect();
                Some((stream::iter(tail), (bytes, decoder, true)))
            }
        }
    })
    .flatten()
    .boxed()
}
