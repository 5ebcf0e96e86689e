//! Streaming client for OpenAI-compatible `/chat/completions`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::{json, Value};

use crate::config::schema::{TimeoutConfig, ToolConfig, UpstreamConfig};
use crate::conversation::{Message, Role};
use crate::upstream::{ChunkStream, CompletionProvider, CompletionRequest, UpstreamError};

/// Event decoded from the provider's SSE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
    Error(UpstreamError),
}

/// Longest partial line the decoder will hold while waiting for a newline.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// Incremental decoder for `data:` lines. Bytes may be split anywhere,
/// including inside a UTF-8 sequence.
///
/// Bytes already searched for a newline are not searched again, so feeding
/// a long line in many small pieces stays linear. A partial line longer than
/// [`MAX_LINE_BYTES`] yields one [`UpstreamError::Protocol`] and the decoder
/// produces nothing after it.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    scanned: usize,
    overflowed: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        if self.overflowed {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            if let Some(event) = decode_line(&String::from_utf8_lossy(&self.buffer[start..=end])) {
                events.push(event);
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_LINE_BYTES {
            self.overflowed = true;
            self.buffer = Vec::new();
            self.scanned = 0;
            events.push(SseEvent::Error(UpstreamError::Protocol(format!(
                "stream line exceeds {MAX_LINE_BYTES} bytes"
            ))));
        }
        events
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if self.overflowed {
            return None;
        }
        decode_line(&String::from_utf8_lossy(&rest))
    }
}

fn decode_line(line: &str) -> Option<SseEvent> {
    let trimmed = line.trim();
    let data = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))?
        .trim();

    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            return Some(SseEvent::Error(UpstreamError::Protocol(format!(
                "invalid stream chunk: {e}"
            ))))
        }
    };

    if let Some(error) = value.get("error") {
        let (message, code, error_type) = error_fields(error);
        return Some(SseEvent::Error(UpstreamError::Stream {
            message,
            code,
            error_type,
        }));
    }

    value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(|s| SseEvent::Delta(s.to_string()))
}

/// Pull `message`, `code`, `type` out of a provider error object.
fn error_fields(error: &Value) -> (String, Option<String>, Option<String>) {
    let text = |key: &str| match error.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let message = match error {
        Value::String(s) => s.clone(),
        _ => text("message").unwrap_or_default(),
    };
    (message, text("code"), text("type"))
}

/// Build an [`UpstreamError::Status`] from a failed response.
pub fn status_error(status: u16, headers: &HeaderMap, body: &str) -> UpstreamError {
    let retry_after = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let parsed = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").map(error_fields));

    let (message, code, error_type) = match parsed {
        Some(fields) => fields,
        None => (body.chars().take(512).collect(), None, None),
    };

    UpstreamError::Status {
        status,
        message,
        code,
        error_type,
        retry_after,
    }
}

/// OpenAI-compatible streaming provider.
pub struct OpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: Option<u32>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl OpenAiProvider {
    /// Build from config, reading the API key from `api_key_env`.
    pub fn from_config(
        upstream: &UpstreamConfig,
        timeouts: &TimeoutConfig,
    ) -> Result<Self, UpstreamError> {
        let api_key = std::env::var(&upstream.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(
                env = %upstream.api_key_env,
                "Upstream API key not set; requests will be sent unauthenticated"
            );
        }
        Self::new(upstream, timeouts, api_key)
    }

    pub fn new(
        upstream: &UpstreamConfig,
        timeouts: &TimeoutConfig,
        api_key: Option<String>,
    ) -> Result<Self, UpstreamError> {
        let connect_timeout = Duration::from_secs(timeouts.upstream_connect_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", upstream.base_url.trim_end_matches('/')),
            model: upstream.model.clone(),
            api_key,
            max_tokens: upstream.max_tokens,
            connect_timeout,
            idle_timeout: Duration::from_secs(timeouts.upstream_idle_secs),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// JSON body for one request.
    pub fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system_prompt }));
        }
        messages.extend(request.messages.iter().map(message_json));

        let mut body = json!({
            "model": self.model,
            "stream": true,
            "messages": messages,
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(tool_json).collect());
        }
        body
    }
}

/// Tool messages are folded into user turns. The provider only accepts a
/// `tool` message as the answer to an assistant `tool_calls` entry, and the
/// gateway never forwards those, so a raw `tool` role would be rejected.
/// The message `id`, when present, labels the result.
fn message_json(message: &Message) -> Value {
    match message.role {
        Role::Tool => {
            let label = match &message.id {
                Some(id) => format!("Tool result ({id}):"),
                None => "Tool result:".to_string(),
            };
            json!({ "role": Role::User.as_str(), "content": format!("{label}\n{}", message.content) })
        }
        role => json!({ "role": role.as_str(), "content": message.content }),
    }
}

fn tool_json(tool: &ToolConfig) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn transport_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout(e.to_string())
    } else {
        UpstreamError::Transport(e.to_string())
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<ChunkStream, UpstreamError> {
        let mut builder = self.client.post(&self.endpoint).json(&self.request_body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::time::timeout(self.connect_timeout, builder.send())
            .await
            .map_err(|_| {
                UpstreamError::Timeout(format!(
                    "no response headers within {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = tokio::time::timeout(self.idle_timeout, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            return Err(status_error(status.as_u16(), &headers, &body));
        }

        tracing::debug!(endpoint = %self.endpoint, model = %self.model, "Upstream stream opened");
        Ok(decode_stream(response.bytes_stream().boxed(), self.idle_timeout))
    }
}

struct DecodeState {
    body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, UpstreamError>>,
    idle: Duration,
    finished: bool,
}

/// Turn a raw SSE byte stream into text chunks. Ends after `[DONE]`, the
/// first error, or end of body.
fn decode_stream(
    body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    idle: Duration,
) -> ChunkStream {
    let state = DecodeState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        idle,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match tokio::time::timeout(state.idle, state.body.next()).await {
                Ok(Some(Ok(bytes))) => {
                    let events = state.decoder.push(&bytes);
                    state.enqueue(events);
                }
                Ok(Some(Err(e))) => {
                    state.pending.push_back(Err(transport_error(e)));
                    state.finished = true;
                }
                Ok(None) => {
                    let tail = state.decoder.finish();
                    state.enqueue(tail.into_iter().collect());
                    state.finished = true;
                }
                Err(_) => {
                    state.pending.push_back(Err(UpstreamError::Timeout(format!(
                        "no stream data for {}s",
                        state.idle.as_secs()
                    ))));
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

impl DecodeState {
    fn enqueue(&mut self, events: Vec<SseEvent>) {
        for event in events {
            if self.finished {
                break;
            }
            match event {
                SseEvent::Delta(text) => self.pending.push_back(Ok(text)),
                SseEvent::Done => self.finished = true,
                SseEvent::Error(e) => {
                    self.pending.push_back(Err(e));
                    self.finished = true;
                }
            }
        }
    }
}
