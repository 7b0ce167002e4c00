use super::{
    BackendConfig, EventSink, EventStream, FinishReason, GenerationBackend, StreamEvent,
    encode_text_history, event_channel, value_text,
};
use crate::error::AppResult;
use crate::normalize::{ChatRequest, ConversationMessage};
use crate::prompt::{AGENT_SCRATCHPAD, CHAT_HISTORY, PromptTemplate};
use crate::tools::{ExecutionSite, ToolSet, agent_tools};
use crate::upstream::{
    ContentPart, ModelProvider, ProviderEvent, ProviderMessage, ProviderRequest, ProviderRole,
    StopReason, ToolCall, Usage,
};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;

pub const MAX_AGENT_ITERATIONS: usize = 15;

/// Tool-calling agent loop. The model may call tools any number of times
/// (bounded by [`MAX_AGENT_ITERATIONS`]); only its text reaches the caller.
#[derive(Clone)]
pub struct AgentBackend {
    provider: Arc<dyn ModelProvider>,
    tools: ToolSet,
    config: BackendConfig,
}

impl AgentBackend {
    pub fn new(provider: Arc<dyn ModelProvider>, config: BackendConfig) -> Self {
        Self {
            provider,
            tools: agent_tools(),
            config,
        }
    }
}

impl GenerationBackend for AgentBackend {
    fn generate(&self, request: ChatRequest) -> EventStream {
        let (sink, events) = event_channel(self.config.event_buffer);
        let agent = self.clone();
        tokio::spawn(async move { agent.run(request, sink).await });
        events
    }
}

fn chat_history(request: &ChatRequest) -> AppResult<Vec<ProviderMessage>> {
    let decoded = ConversationMessage::decode_all(&request.messages)?;
    Ok(encode_text_history(&decoded))
}

impl AgentBackend {
    async fn run(self, request: ChatRequest, sink: EventSink) {
        let history = match chat_history(&request) {
            Ok(history) => history,
            Err(err) => return sink.fail(err).await,
        };
        let template = PromptTemplate::tool_calling(&request.settings.system);
        let model = request.settings.tier().provider_model_id();
        let mut scratchpad: Vec<ProviderMessage> = Vec::new();
        let mut usage = Usage::default();

        for iteration in 0..MAX_AGENT_ITERATIONS {
            let vars = HashMap::from([
                (CHAT_HISTORY, history.as_slice()),
                (AGENT_SCRATCHPAD, scratchpad.as_slice()),
            ]);
            let prompt = template.format(&vars);
            let provider_request = ProviderRequest {
                model: model.to_string(),
                system: prompt.system,
                messages: prompt.messages,
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
                            tracing::debug!("consumer gone, abandoning agent run");
                            return;
                        }
                    }
                    Ok(ProviderEvent::ToolCallChunk {
                        id,
                        name,
                        partial_json,
                    }) => {
                        tracing::info!(tool = %name, id = %id, chunk = %partial_json, "agent tool call chunk");
                    }
                    Ok(ProviderEvent::ToolCall(call)) => {
                        tracing::info!(tool = %call.name, id = %call.id, args = %call.input, iteration, "agent tool call");
                        calls.push(call);
                    }
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
                let finish_reason = match FinishReason::from(stop_reason) {
                    FinishReason::ToolCalls => FinishReason::Stop,
                    other => other,
                };
                return sink.finish(finish_reason, usage.into()).await;
            }

            let mut observations = Vec::with_capacity(calls.len());
            for call in &calls {
                observations.push(self.observe(call).await);
            }
            let mut step = Vec::with_capacity(calls.len() + 1);
            if !text.is_empty() {
                step.push(ContentPart::Text(text));
            }
            step.extend(calls.into_iter().map(|call| ContentPart::ToolUse {
                id: call.id,
                name: call.name,
                input: call.input,
            }));
            scratchpad.push(ProviderMessage::new(ProviderRole::Assistant, step));
            scratchpad.push(ProviderMessage::new(ProviderRole::User, observations));
        }

        tracing::warn!(
            iterations = MAX_AGENT_ITERATIONS,
            "agent stopped due to max iterations"
        );
        sink.finish(FinishReason::Stop, usage.into()).await
    }

    async fn observe(&self, call: &ToolCall) -> ContentPart {
        let executor = match self.tools.find(&call.name).map(|def| &def.site) {
            Some(ExecutionSite::Server(executor)) => Some(executor),
            _ => None,
        };
        let (content, is_error) = match executor {
            Some(executor) => {
                metrics::counter!("chat_relay_tool_calls_total", "tool" => call.name.clone())
                    .increment(1);
                match executor.execute(&call.input).await {
                    Ok(value) => (value_text(&value), false),
                    Err(err) => {
                        tracing::warn!(tool = %call.name, error = %err, "agent tool failed");
                        (err.to_string(), true)
                    }
                }
            }
            None => {
                tracing::warn!(tool = %call.name, "agent requested unknown tool");
                (
                    format!("{} is not a valid tool, try another one.", call.name),
                    true,
                )
            }
        };
        tracing::info!(tool = %call.name, id = %call.id, observation = %content, "agent tool observation");
        ContentPart::ToolResult {
            tool_use_id: call.id.clone(),
            content,
            is_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{Script, ScriptedProvider};
    use crate::settings::{CLAUDE_3_SONNET, Settings};
    use crate::upstream::UpstreamCallError;
    use serde_json::{Value, json};

    fn config() -> BackendConfig {
        BackendConfig {
            max_tokens: 256,
            event_buffer: 8,
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            messages: vec![
                json!({
                    "role": "user",
                    "content": "Weather in Paris?",
                    "experimental_attachments": [{ "url": "https://example.com/paris.jpg" }]
                })
                .as_object()
                .unwrap()
                .clone(),
            ],
            settings: Settings {
                model: "claude-3-sonnet".to_string(),
                temperature: 0.0,
                system: "You are helpful".to_string(),
                framework: Some("langchain".to_string()),
            },
        }
    }

    fn finished() -> Result<ProviderEvent, UpstreamCallError> {
        Ok(ProviderEvent::Finished {
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
        })
    }

    fn tool_round(id: &str, name: &str, input: Value) -> Script {
        vec![
            Ok(ProviderEvent::ToolCallChunk {
                id: id.to_string(),
                name: name.to_string(),
                partial_json: input.to_string(),
            }),
            Ok(ProviderEvent::ToolCall(ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input,
            })),
            Ok(ProviderEvent::Finished {
                stop_reason: StopReason::ToolUse,
                usage: Usage::default(),
            }),
        ]
    }

    #[tokio::test]
    async fn only_text_reaches_the_caller() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_round("t1", "weather_tool", json!({"city": "Paris"})),
            vec![
                Ok(ProviderEvent::TextDelta("It is sunny ".to_string())),
                Ok(ProviderEvent::TextDelta("in Paris.".to_string())),
                finished(),
            ],
        ]));
        let backend = AgentBackend::new(provider.clone(), config());
        let events: Vec<StreamEvent> = backend.generate(request()).collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::ContentDelta("It is sunny ".to_string()));
        assert_eq!(events[1], StreamEvent::ContentDelta("in Paris.".to_string()));
        assert!(matches!(
            events[2],
            StreamEvent::Done {
                finish_reason: FinishReason::Stop,
                ..
            }
        ));

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].model, CLAUDE_3_SONNET);
        assert_eq!(requests[0].system.as_deref(), Some("You are helpful"));
        assert_eq!(requests[0].messages[0].parts.len(), 2);
        let second = &requests[1].messages;
        assert_eq!(second.len(), 3);
        assert_eq!(
            second[2].parts[0],
            ContentPart::ToolResult {
                tool_use_id: "t1".to_string(),
                content: "The weather in Paris is sunny".to_string(),
                is_error: false,
            }
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_back_to_the_model() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_round("t1", "stock_tool", json!({})),
            vec![finished()],
        ]));
        let backend = AgentBackend::new(provider.clone(), config());
        let _: Vec<StreamEvent> = backend.generate(request()).collect().await;
        let requests = provider.requests.lock().unwrap();
        assert!(matches!(
            &requests[1].messages[2].parts[0],
            ContentPart::ToolResult { content, is_error: true, .. }
                if content == "stock_tool is not a valid tool, try another one."
        ));
    }

    #[tokio::test]
    async fn history_tool_invocations_are_not_replayed() {
        let mut request = request();
        request.messages.push(
            json!({
                "role": "assistant",
                "content": "Let me check.",
                "toolInvocations": [{
                    "toolCallId": "call_1", "toolName": "getLocation",
                    "args": { "consent": true }, "state": "call"
                }]
            })
            .as_object()
            .unwrap()
            .clone(),
        );
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            Ok(ProviderEvent::TextDelta("Sunny.".to_string())),
            finished(),
        ]]));
        let backend = AgentBackend::new(provider.clone(), config());
        let events: Vec<StreamEvent> = backend.generate(request).collect().await;
        assert_eq!(events[0], StreamEvent::ContentDelta("Sunny.".to_string()));
        let requests = provider.requests.lock().unwrap();
        assert_eq!(
            requests[0].messages[1].parts,
            vec![ContentPart::Text("Let me check.".to_string())]
        );
    }

    #[tokio::test]
    async fn iteration_cap_ends_with_stop() {
        let scripts = (0..MAX_AGENT_ITERATIONS)
            .map(|i| tool_round(&format!("t{i}"), "weather_tool", json!({"city": "Rome"})))
            .collect();
        let provider = Arc::new(ScriptedProvider::new(scripts));
        let backend = AgentBackend::new(provider.clone(), config());
        let events: Vec<StreamEvent> = backend.generate(request()).collect().await;
        assert_eq!(provider.calls(), MAX_AGENT_ITERATIONS);
        assert!(matches!(
            events.as_slice(),
            [StreamEvent::Done {
                finish_reason: FinishReason::Stop,
                ..
            }]
        ));
    }
}
