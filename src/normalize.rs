use crate::error::{AppError, AppResult};
use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A validated chat request. Message entries are only checked for shape here;
/// their fields are decoded by the backend that consumes them.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Map<String, Value>>,
    pub settings: Settings,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    messages: Vec<Map<String, Value>>,
    settings: Settings,
}

pub fn normalize(raw: &[u8]) -> AppResult<ChatRequest> {
    let body: ChatBody = serde_json::from_slice(raw).map_err(|err| {
        tracing::debug!(error = %err, "request body rejected");
        AppError::bad_request("invalid_body", err.to_string())
    })?;
    Ok(ChatRequest {
        messages: body.messages,
        settings: body.settings,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default, rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A tool call recorded on an assistant message by the client, with the
/// result it supplied once the tool ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    #[serde(rename = "toolName")]
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(
        default,
        alias = "experimental_attachments",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub attachments: Vec<Attachment>,
    #[serde(
        default,
        rename = "toolInvocations",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tool_invocations: Vec<ToolInvocation>,
}

impl ConversationMessage {
    pub fn decode_all(raw: &[Map<String, Value>]) -> AppResult<Vec<Self>> {
        raw.iter()
            .enumerate()
            .map(|(idx, entry)| {
                serde_json::from_value::<Self>(Value::Object(entry.clone())).map_err(|err| {
                    AppError::upstream(
                        "message_conversion_failed",
                        format!("message {idx}: {err}"),
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn body(value: Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    #[test]
    fn accepts_valid_request() {
        let req = normalize(&body(json!({
            "messages": [{ "role": "user", "content": "Hi" }],
            "settings": { "model": "claude-3-haiku", "temperature": 0.5, "system": "Be brief" }
        })))
        .expect("valid request");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.settings.model, "claude-3-haiku");
        assert_eq!(req.settings.temperature, 0.5);
    }

    #[test]
    fn rejects_invalid_json() {
        let err = normalize(b"{not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn rejects_missing_or_mistyped_settings_fields() {
        let cases = [
            json!({ "messages": [], "settings": { "temperature": 0.5, "system": "" } }),
            json!({ "messages": [], "settings": { "model": "m", "system": "" } }),
            json!({ "messages": [], "settings": { "model": "m", "temperature": 0.5 } }),
            json!({ "messages": [], "settings": { "model": 3, "temperature": 0.5, "system": "" } }),
            json!({ "messages": [], "settings": { "model": "m", "temperature": "hot", "system": "" } }),
            json!({ "messages": [] }),
        ];
        for case in cases {
            let err = normalize(&body(case.clone())).unwrap_err();
            assert_eq!(err.kind, ErrorKind::BadRequest, "case {case}");
        }
    }

    #[test]
    fn integer_temperature_is_a_number() {
        let req = normalize(&body(json!({
            "messages": [],
            "settings": { "model": "m", "temperature": 1, "system": "" }
        })))
        .expect("integer temperature");
        assert_eq!(req.settings.temperature, 1.0);
    }

    #[test]
    fn message_fields_are_not_validated_up_front() {
        let req = normalize(&body(json!({
            "messages": [{ "role": "moderator", "content": 5 }],
            "settings": { "model": "m", "temperature": 0.1, "system": "" }
        })))
        .expect("shape-only validation");
        let err = ConversationMessage::decode_all(&req.messages).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UpstreamFailure);
    }

    #[test]
    fn decodes_attachments_and_tool_invocations() {
        let raw = json!({
            "role": "assistant",
            "content": "",
            "toolInvocations": [{
                "toolCallId": "call_1",
                "toolName": "askForConfirmation",
                "args": { "message": "ok?" },
                "result": "Yes",
                "state": "result"
            }]
        });
        let user = json!({
            "role": "user",
            "content": "look",
            "experimental_attachments": [{ "url": "https://example.com/a.png", "contentType": "image/png" }]
        });
        let messages = ConversationMessage::decode_all(&[
            user.as_object().unwrap().clone(),
            raw.as_object().unwrap().clone(),
        ])
        .expect("decode");
        assert_eq!(messages[0].attachments.len(), 1);
        assert_eq!(messages[1].tool_invocations[0].result, Some(json!("Yes")));
    }
}
