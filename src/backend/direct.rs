use super::{
    BackendConfig, EventSink, EventStream, FinishReason, GenerationBackend, StreamEvent,
    encode_conversation, event_channel, value_text,
};
use crate::error::{AppError, AppResult};
use crate::normalize::{ChatRequest, ConversationMessage, Role};
use crate::tools::{ExecutionSite, ToolSet, direct_tools};
use crate::upstream::{
    ContentPart, ModelProvider, ProviderEvent, ProviderMessage, ProviderRequest, ProviderRole,
    StopReason, ToolCall, Usage,
};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;

pub const MAX_TOOL_ROUNDTRIPS: usize = 5;

/// Streams model output straight through, running server tools in-process
/// and handing client tools back to the caller.
#[derive(Clone)]
pub struct DirectBackend {
    provider: Arc<dyn ModelProvider>,
    tools: ToolSet,
    config: BackendConfig,
}

impl DirectBackend {
    pub fn new(provider: Arc<dyn ModelProvider>, config: BackendConfig) -> Self {
        Self {
            provider,
            tools: direct_tools(),
            config,
        }
    }
}

impl GenerationBackend for DirectBackend {
    fn generate(&self, request: ChatRequest) -> EventStream {
        let (sink, events) = event_channel(self.config.event_buffer);
        let backend = self.clone();
        tokio::spawn(async move { backend.run(request, sink).await });
        events
    }
}

/// Tool round trips already spent in the current turn: assistant messages
/// carrying tool invocations after the last user message.
pub fn prior_roundtrips(messages: &[ConversationMessage]) -> usize {
    let start = messages
        .iter()
        .rposition(|m| m.role == Role::User)
        .map(|idx| idx + 1)
        .unwrap_or(0);
    messages[start..]
        .iter()
        .filter(|m| m.role == Role::Assistant && !m.tool_invocations.is_empty())
        .count()
}

fn prepare(request: &ChatRequest) -> AppResult<(Vec<ProviderMessage>, usize)> {
    let decoded = ConversationMessage::decode_all(&request.messages)?;
    Ok((encode_conversation(&decoded)?, prior_roundtrips(&decoded)))
}

enum Step {
    Continue,
    AwaitClient,
    Stopped,
}

impl DirectBackend {
    async fn run(self, request: ChatRequest, sink: EventSink) {
        let (mut messages, mut roundtrips) = match prepare(&request) {
            Ok(prepared) => prepared,
            Err(err) => return sink.fail(err).await,
        };
        let model = request.settings.tier().provider_model_id();
        let mut usage = Usage::default();

        loop {
            let provider_request = ProviderRequest {
                model: model.to_string(),
                system: Some(request.settings.system.clone()),
                messages: messages.clone(),
                temperature: request.settings.temperature,
                max_tokens: self.config.max_tokens,
                tools: self.tools.specs(),
            };
            let mut stream = match self.provider.stream(provider_request).await {
                Ok(stream) => stream,
                Err(err) => return sink.fail(err.into()).await,
            };

            let mut text = String::new();
            let mut calls: Vec<ToolCall> = Vec::new();
            let mut stop_reason = StopReason::EndTurn;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(ProviderEvent::TextDelta(delta)) => {
                        text.push_str(&delta);
                        if !sink.emit(StreamEvent::ContentDelta(delta)).await {
                            tracing::debug!("consumer gone, abandoning generation");
                            return;
                        }
                    }
                    Ok(ProviderEvent::ToolCallChunk { .. }) => {}
                    Ok(ProviderEvent::ToolCall(call)) => calls.push(call),
                    Ok(ProviderEvent::Finished {
                        stop_reason: reason,
                        usage: turn,
                    }) => {
                        stop_reason = reason;
                        usage.add(turn);
                    }
                    Err(err) => return sink.fail(err.into()).await,
                }
            }

            if calls.is_empty() {
                return sink.finish(stop_reason.into(), usage.into()).await;
            }
            if roundtrips >= MAX_TOOL_ROUNDTRIPS {
                tracing::warn!(roundtrips, "tool round trip limit reached");
                return sink
                    .fail(AppError::upstream(
                        "tool_roundtrip_limit",
                        format!("more than {MAX_TOOL_ROUNDTRIPS} tool round trips in one turn"),
                    ))
                    .await;
            }
            roundtrips += 1;

            let mut results = Vec::with_capacity(calls.len());
            let mut awaiting_client = false;
            for call in &calls {
                match self.handle_call(call, &sink, &mut results).await {
                    Ok(Step::Continue) => {}
                    Ok(Step::AwaitClient) => awaiting_client = true,
                    Ok(Step::Stopped) => return,
                    Err(err) => return sink.fail(err).await,
                }
            }
            if awaiting_client {
                return sink.finish(FinishReason::ToolCalls, usage.into()).await;
            }

            let mut assistant = Vec::with_capacity(calls.len() + 1);
            if !text.is_empty() {
                assistant.push(ContentPart::Text(text));
            }
            assistant.extend(calls.into_iter().map(|call| ContentPart::ToolUse {
                id: call.id,
                name: call.name,
                input: call.input,
            }));
            messages.push(ProviderMessage::new(ProviderRole::Assistant, assistant));
            messages.push(ProviderMessage::new(ProviderRole::User, results));
        }
    }

    async fn handle_call(
        &self,
        call: &ToolCall,
        sink: &EventSink,
        results: &mut Vec<ContentPart>,
    ) -> AppResult<Step> {
        let Some(def) = self.tools.find(&call.name) else {
            return Err(AppError::upstream(
                "unknown_tool",
                format!("model requested undeclared tool {}", call.name),
            ));
        };
        metrics::counter!("chat_relay_tool_calls_total", "tool" => def.name.clone()).increment(1);
        tracing::info!(tool = %call.name, id = %call.id, site = def.site.as_str(), "tool call requested");
        let requested = StreamEvent::ToolCallRequested {
            id: call.id.clone(),
            name: call.name.clone(),
            args: call.input.clone(),
        };
        if !sink.emit(requested).await {
            return Ok(Step::Stopped);
        }
        let ExecutionSite::Server(executor) = &def.site else {
            return Ok(Step::AwaitClient);
        };
        let (result, is_error) = match executor.execute(&call.input).await {
            Ok(value) => (value, false),
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "server tool failed");
                (Value::String(err.to_string()), true)
            }
        };
        results.push(ContentPart::ToolResult {
            tool_use_id: call.id.clone(),
            content: value_text(&result),
            is_error,
        });
        let delivered = sink
            .emit(StreamEvent::ToolCallResult {
                id: call.id.clone(),
                result,
            })
            .await;
        Ok(if delivered { Step::Continue } else { Step::Stopped })
    }
}
