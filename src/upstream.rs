use crate::config::{ProviderAuthType, UpstreamConfig};
use crate::error::AppError;
use async_trait::async_trait;
use axum::http::StatusCode;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Protocol,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?} upstream error: {message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Protocol, None, message.into())
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

impl From<UpstreamCallError> for AppError {
    fn from(err: UpstreamCallError) -> Self {
        let code = err
            .code
            .clone()
            .unwrap_or_else(|| "upstream_call_failed".to_string());
        AppError::upstream(code, err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRole {
    User,
    Assistant,
}

impl ProviderRole {
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Url(String),
    Base64 { media_type: String, data: String },
}

impl ImageSource {
    /// `data:<media>;base64,<payload>` URLs are inlined; anything else is
    /// passed to the provider as a URL reference.
    pub fn from_url(url: &str) -> Self {
        if let Some(rest) = url.strip_prefix("data:") {
            if let Some((meta, data)) = rest.split_once(',') {
                if let Some(media_type) = meta.strip_suffix(";base64") {
                    return Self::Base64 {
                        media_type: media_type.to_string(),
                        data: data.to_string(),
                    };
                }
            }
        }
        Self::Url(url.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Image(ImageSource),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderMessage {
    pub role: ProviderRole,
    pub parts: Vec<ContentPart>,
}

impl ProviderMessage {
    pub fn new(role: ProviderRole, parts: Vec<ContentPart>) -> Self {
        Self { role, parts }
    }
}

/// Adjacent messages with the same role are folded into one, as the
/// provider requires strictly alternating turns.
pub fn merge_same_role_messages(messages: Vec<ProviderMessage>) -> Vec<ProviderMessage> {
    let mut merged: Vec<ProviderMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        if let Some(last) = merged.last_mut() {
            if last.role == message.role {
                last.parts.extend(message.parts);
                continue;
            }
        }
        merged.push(message);
    }
    merged
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ProviderMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    Other,
}

impl StopReason {
    fn parse(s: &str) -> Self {
        match s {
            "end_turn" => Self::EndTurn,
            "max_tokens" => Self::MaxTokens,
            "tool_use" => Self::ToolUse,
            "stop_sequence" => Self::StopSequence,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    /// Partial tool arguments as they stream in; informational only.
    ToolCallChunk {
        id: String,
        name: String,
        partial_json: String,
    },
    ToolCall(ToolCall),
    Finished {
        stop_reason: StopReason,
        usage: Usage,
    },
}

pub type ProviderStream =
    Pin<Box<dyn Stream<Item = Result<ProviderEvent, UpstreamCallError>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream(&self, request: ProviderRequest) -> Result<ProviderStream, UpstreamCallError>;
}

/// Streams completions from an endpoint speaking the Anthropic Messages API.
pub struct MessagesProvider {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl MessagesProvider {
    pub fn new(http: reqwest::Client, config: UpstreamConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ModelProvider for MessagesProvider {
    async fn stream(&self, request: ProviderRequest) -> Result<ProviderStream, UpstreamCallError> {
        let body = encode_request(&request);
        let url = join_url(&self.config.base_url, "/v1/messages");
        let mut req = self
            .http
            .post(url)
            .timeout(std::time::Duration::from_millis(self.config.timeout_ms))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body);
        req = apply_auth(req, &self.config);
        tracing::debug!(model = %request.model, messages = request.messages.len(), "calling model provider");
        let resp = req
            .send()
            .await
            .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let code = extract_error_code(&text);
            return Err(UpstreamCallError::new(
                UpstreamErrorKind::Http,
                StatusCode::from_u16(status.as_u16()).ok(),
                format!("upstream status {}: {}", status, text),
            )
            .with_code(code));
        }
        Ok(decode_sse(resp.bytes_stream()))
    }
}

fn apply_auth(req: reqwest::RequestBuilder, config: &UpstreamConfig) -> reqwest::RequestBuilder {
    let Some(key) = config.api_key.as_deref() else {
        return req;
    };
    match config.auth {
        ProviderAuthType::Bearer => req.bearer_auth(key),
        ProviderAuthType::Header => req.header("x-api-key", key),
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    format!("{}/{}", base, path)
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("type").or_else(|| v.get("code")))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn encode_request(req: &ProviderRequest) -> Value {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|message| {
            let content: Vec<Value> = message.parts.iter().map(encode_part).collect();
            json!({ "role": message.role.as_str(), "content": content })
        })
        .collect();

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(req.model.clone()));
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("max_tokens".to_string(), Value::from(req.max_tokens));
    body.insert("temperature".to_string(), Value::from(req.temperature));
    body.insert("stream".to_string(), Value::Bool(true));
    if let Some(system) = req.system.as_deref().filter(|s| !s.is_empty()) {
        body.insert("system".to_string(), Value::String(system.to_string()));
    }
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tools));
    }
    Value::Object(body)
}

fn encode_part(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text(text) => json!({ "type": "text", "text": text }),
        ContentPart::Image(ImageSource::Url(url)) => json!({
            "type": "image",
            "source": { "type": "url", "url": url }
        }),
        ContentPart::Image(ImageSource::Base64 { media_type, data }) => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data }
        }),
        ContentPart::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input
        }),
        ContentPart::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "is_error": is_error,
            "content": [{ "type": "text", "text": content }]
        }),
    }
}

#[derive(Debug, Default)]
struct PendingToolUse {
    id: String,
    name: String,
    arguments: String,
}

/// Turns Messages API stream events into [`ProviderEvent`]s.
#[derive(Debug, Default)]
pub struct MessagesDecoder {
    tools: HashMap<u64, PendingToolUse>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    finished: bool,
    aborted: bool,
}

impl MessagesDecoder {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn is_done(&self) -> bool {
        self.finished || self.aborted
    }

    fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn ingest(&mut self, data: &str) -> Result<Vec<ProviderEvent>, UpstreamCallError> {
        let data_val: Value = serde_json::from_str(data).unwrap_or(Value::Null);
        let event_type = data_val.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let mut out = Vec::new();
        match event_type {
            "message_start" => {
                if let Some(n) = data_val
                    .pointer("/message/usage/input_tokens")
                    .and_then(|v| v.as_u64())
                {
                    self.usage.input_tokens = n;
                }
            }
            "content_block_start" => {
                let index = data_val.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let cb = data_val.get("content_block").cloned().unwrap_or(Value::Null);
                match cb.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "tool_use" => {
                        let id = cb.get("id").and_then(|v| v.as_str()).unwrap_or("");
                        let name = cb.get("name").and_then(|v| v.as_str()).unwrap_or("");
                        self.tools.insert(
                            index,
                            PendingToolUse {
                                id: id.to_string(),
                                name: name.to_string(),
                                arguments: String::new(),
                            },
                        );
                    }
                    "text" => {
                        if let Some(text) = cb.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                out.push(ProviderEvent::TextDelta(text.to_string()));
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let index = data_val.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let delta = data_val.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                out.push(ProviderEvent::TextDelta(text.to_string()));
                            }
                        }
                    }
                    "input_json_delta" => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        if let Some(pending) = self.tools.get_mut(&index) {
                            pending.arguments.push_str(partial);
                            out.push(ProviderEvent::ToolCallChunk {
                                id: pending.id.clone(),
                                name: pending.name.clone(),
                                partial_json: partial.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = data_val.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(pending) = self.tools.remove(&index) {
                    let input = if pending.arguments.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str::<Value>(&pending.arguments).map_err(|err| {
                            UpstreamCallError::protocol(format!(
                                "tool {} arguments are not json: {err}",
                                pending.name
                            ))
                        })?
                    };
                    out.push(ProviderEvent::ToolCall(ToolCall {
                        id: pending.id,
                        name: pending.name,
                        input,
                    }));
                }
            }
            "message_delta" => {
                if let Some(reason) = data_val.pointer("/delta/stop_reason").and_then(|v| v.as_str()) {
                    self.stop_reason = Some(StopReason::parse(reason));
                }
                if let Some(n) = data_val
                    .pointer("/usage/output_tokens")
                    .and_then(|v| v.as_u64())
                {
                    self.usage.output_tokens = n;
                }
            }
            "message_stop" => {
                self.finished = true;
                out.push(ProviderEvent::Finished {
                    stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                    usage: self.usage,
                });
            }
            "error" => {
                let err = data_val.get("error").cloned().unwrap_or(Value::Null);
                let message = err
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("upstream stream error")
                    .to_string();
                let code = err.get("type").and_then(|v| v.as_str()).map(str::to_string);
                return Err(
                    UpstreamCallError::new(UpstreamErrorKind::Http, None, message).with_code(code)
                );
            }
            _ => {}
        }
        Ok(out)
    }
}

/// Decodes an SSE byte stream lazily: one upstream event is pulled only when
/// the consumer asks for the next item.
pub fn decode_sse<S, B, E>(bytes: S) -> ProviderStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let events = Box::pin(bytes.eventsource());
    let state = (events, MessagesDecoder::default(), VecDeque::new());
    Box::pin(futures_util::stream::unfold(
        state,
        |(mut events, mut decoder, mut queue)| async move {
            loop {
                if let Some(event) = queue.pop_front() {
                    return Some((Ok(event), (events, decoder, queue)));
                }
                if decoder.is_done() {
                    return None;
                }
                match events.next().await {
                    Some(Ok(ev)) => match decoder.ingest(&ev.data) {
                        Ok(out) => queue.extend(out),
                        Err(err) => {
                            decoder.abort();
                            return Some((Err(err), (events, decoder, queue)));
                        }
                    },
                    Some(Err(err)) => {
                        decoder.abort();
                        let err = UpstreamCallError::new(
                            UpstreamErrorKind::Network,
                            None,
                            err.to_string(),
                        );
                        return Some((Err(err), (events, decoder, queue)));
                    }
                    None => {
                        let finished = decoder.is_finished();
                        decoder.abort();
                        if finished {
                            return None;
                        }
                        let err = UpstreamCallError::protocol("stream ended before message_stop");
                        return Some((Err(err), (events, decoder, queue)));
                    }
                }
            }
        },
    ))
}
