pub mod agent;
pub mod direct;

use crate::config::UpstreamConfig;
use crate::error::{AppError, AppResult, ErrorKind};
use crate::normalize::{ChatRequest, ConversationMessage, Role};
use crate::settings::BackendKind;
use crate::upstream::{
    ContentPart, ImageSource, ModelProvider, ProviderMessage, ProviderRole, StopReason,
    merge_same_role_messages,
};
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Other,
}

impl From<StopReason> for FinishReason {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::EndTurn | StopReason::StopSequence => Self::Stop,
            StopReason::MaxTokens => Self::Length,
            StopReason::ToolUse => Self::ToolCalls,
            StopReason::Other => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl From<crate::upstream::Usage> for Usage {
    fn from(usage: crate::upstream::Usage) -> Self {
        Self {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
        }
    }
}

/// Normalized generation event. `Done` and `Error` are terminal; a producer
/// emits at most one of them and nothing after it.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ContentDelta(String),
    ToolCallRequested {
        id: String,
        name: String,
        args: Value,
    },
    ToolCallResult {
        id: String,
        result: Value,
    },
    Done {
        finish_reason: FinishReason,
        usage: Usage,
    },
    Error(ErrorKind),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error(_))
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Producer half of a backend's event channel. The terminal methods take
/// `self`, so nothing can be sent after `Done` or `Error`.
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    /// Returns false once the consumer is gone; the producer should stop.
    pub async fn emit(&self, event: StreamEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub async fn finish(self, finish_reason: FinishReason, usage: Usage) {
        let _ = self
            .tx
            .send(StreamEvent::Done {
                finish_reason,
                usage,
            })
            .await;
    }

    pub async fn fail(self, err: AppError) {
        tracing::error!(code = %err.code, message = %err.message, "generation failed");
        let _ = self.tx.send(StreamEvent::Error(err.kind)).await;
    }
}

pub fn event_channel(buffer: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (EventSink { tx }, Box::pin(ReceiverStream::new(rx)))
}

/// A generation strategy. `generate` returns immediately; events are produced
/// by a background task and pulled lazily by the consumer.
pub trait GenerationBackend: Send + Sync {
    fn generate(&self, request: ChatRequest) -> EventStream;
}

#[derive(Debug, Clone, Copy)]
pub struct BackendConfig {
    pub max_tokens: u32,
    pub event_buffer: usize,
}

impl BackendConfig {
    pub fn from_upstream(upstream: &UpstreamConfig, event_buffer: usize) -> Self {
        Self {
            max_tokens: upstream.max_tokens,
            event_buffer,
        }
    }
}

#[derive(Clone)]
pub struct Backends {
    direct: Arc<dyn GenerationBackend>,
    agent: Arc<dyn GenerationBackend>,
}

impl Backends {
    pub fn new(direct: Arc<dyn GenerationBackend>, agent: Arc<dyn GenerationBackend>) -> Self {
        Self { direct, agent }
    }

    pub fn from_provider(provider: Arc<dyn ModelProvider>, config: BackendConfig) -> Self {
        Self::new(
            Arc::new(direct::DirectBackend::new(provider.clone(), config)),
            Arc::new(agent::AgentBackend::new(provider, config)),
        )
    }

    pub fn get(&self, kind: BackendKind) -> Arc<dyn GenerationBackend> {
        match kind {
            BackendKind::Direct => self.direct.clone(),
            BackendKind::Agent => self.agent.clone(),
        }
    }
}

pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Text first, then one image part per attachment.
fn user_turn(message: &ConversationMessage) -> ProviderMessage {
    let mut parts = Vec::with_capacity(1 + message.attachments.len());
    if !message.content.is_empty() || message.attachments.is_empty() {
        parts.push(ContentPart::Text(message.content.clone()));
    }
    for attachment in &message.attachments {
        parts.push(ContentPart::Image(ImageSource::from_url(&attachment.url)));
    }
    ProviderMessage::new(ProviderRole::User, parts)
}

/// Plain chat history: user turns as in [`encode_conversation`], assistant
/// turns reduced to their text. Tool invocations are dropped.
pub fn encode_text_history(messages: &[ConversationMessage]) -> Vec<ProviderMessage> {
    let turns = messages.iter().filter_map(|message| match message.role {
        Role::User => Some(user_turn(message)),
        Role::Assistant if message.content.is_empty() => None,
        Role::Assistant => Some(ProviderMessage::new(
            ProviderRole::Assistant,
            vec![ContentPart::Text(message.content.clone())],
        )),
    });
    merge_same_role_messages(turns.collect())
}

/// Converts client messages into provider turns.
///
/// User attachments become image parts next to the text. Assistant tool
/// invocations become tool-use parts answered by a following user turn of
/// tool results; an invocation the client has not answered yet is an error.
pub fn encode_conversation(messages: &[ConversationMessage]) -> AppResult<Vec<ProviderMessage>> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::User => out.push(user_turn(message)),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(ContentPart::Text(message.content.clone()));
                }
                let mut results = Vec::with_capacity(message.tool_invocations.len());
                for invocation in &message.tool_invocations {
                    let Some(result) = invocation.result.as_ref() else {
                        return Err(AppError::upstream(
                            "message_conversion_failed",
                            format!(
                                "tool invocation {} ({}) has no result",
                                invocation.tool_call_id, invocation.tool_name
                            ),
                        ));
                    };
                    parts.push(ContentPart::ToolUse {
                        id: invocation.tool_call_id.clone(),
                        name: invocation.tool_name.clone(),
                        input: invocation.args.clone(),
                    });
                    results.push(ContentPart::ToolResult {
                        tool_use_id: invocation.tool_call_id.clone(),
                        content: value_text(result),
                        is_error: false,
                    });
                }
                if parts.is_empty() {
                    continue;
                }
                out.push(ProviderMessage::new(ProviderRole::Assistant, parts));
                if !results.is_empty() {
                    out.push(ProviderMessage::new(ProviderRole::User, results));
                }
            }
        }
    }
    Ok(merge_same_role_messages(out))
}
