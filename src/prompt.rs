use crate::upstream::{ProviderMessage, merge_same_role_messages};
use std::collections::HashMap;

pub const CHAT_HISTORY: &str = "chat_history";
pub const AGENT_SCRATCHPAD: &str = "agent_scratchpad";

#[derive(Debug, Clone, PartialEq)]
pub enum PromptSlot {
    System(String),
    /// Replaced by the message list bound to this name at format time.
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    slots: Vec<PromptSlot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormattedPrompt {
    pub system: Option<String>,
    pub messages: Vec<ProviderMessage>,
}

impl PromptTemplate {
    pub fn new(slots: Vec<PromptSlot>) -> Self {
        Self { slots }
    }

    pub fn tool_calling(system: &str) -> Self {
        Self::new(vec![
            PromptSlot::System(system.to_string()),
            PromptSlot::Placeholder(CHAT_HISTORY.to_string()),
            PromptSlot::Placeholder(AGENT_SCRATCHPAD.to_string()),
        ])
    }

    /// Unbound placeholders format as nothing.
    pub fn format(&self, vars: &HashMap<&str, &[ProviderMessage]>) -> FormattedPrompt {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut messages = Vec::new();
        for slot in &self.slots {
            match slot {
                PromptSlot::System(text) => {
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                PromptSlot::Placeholder(name) => {
                    if let Some(bound) = vars.get(name.as_str()) {
                        messages.extend(bound.iter().cloned());
                    }
                }
            }
        }
        FormattedPrompt {
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            messages: merge_same_role_messages(messages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{ContentPart, ProviderRole};

    fn user(text: &str) -> ProviderMessage {
        ProviderMessage::new(ProviderRole::User, vec![ContentPart::Text(text.to_string())])
    }

    #[test]
    fn fills_placeholders_in_slot_order() {
        let template = PromptTemplate::tool_calling("Be brief");
        let history = vec![user("Hi")];
        let scratch = vec![ProviderMessage::new(
            ProviderRole::Assistant,
            vec![ContentPart::Text("thinking".to_string())],
        )];
        let vars = HashMap::from([
            (AGENT_SCRATCHPAD, scratch.as_slice()),
            (CHAT_HISTORY, history.as_slice()),
        ]);
        let out = template.format(&vars);
        assert_eq!(out.system.as_deref(), Some("Be brief"));
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].role, ProviderRole::User);
        assert_eq!(out.messages[1].role, ProviderRole::Assistant);
    }

    #[test]
    fn missing_variables_and_empty_system_format_as_nothing() {
        let out = PromptTemplate::tool_calling("").format(&HashMap::new());
        assert!(out.system.is_none());
        assert!(out.messages.is_empty());
    }
}
