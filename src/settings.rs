use serde::{Deserialize, Serialize};

pub const CLAUDE_3_5_SONNET: &str = "anthropic.claude-3-5-sonnet-20240620-v1:0";
pub const CLAUDE_3_SONNET: &str = "anthropic.claude-3-sonnet-20240229-v1:0";
pub const CLAUDE_3_HAIKU: &str = "anthropic.claude-3-haiku-20240307-v1:0";

/// Generation settings sent with every chat request.
///
/// `model`, `temperature` and `system` are required and strictly typed. Extra
/// keys are ignored, except `framework`, which `/chat` uses to pick a backend.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    pub model: String,
    pub temperature: f64,
    pub system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
}

impl Settings {
    pub fn tier(&self) -> ModelTier {
        ModelTier::from_setting(&self.model)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.framework
            .as_deref()
            .map(BackendKind::from_setting)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Balanced,
    Capable,
}

impl ModelTier {
    /// Unrecognized names select the most capable model.
    pub fn from_setting(s: &str) -> Self {
        match s {
            "claude-3-haiku" => Self::Fast,
            "claude-3-sonnet" => Self::Balanced,
            _ => Self::Capable,
        }
    }

    pub fn provider_model_id(self) -> &'static str {
        match self {
            Self::Fast => CLAUDE_3_HAIKU,
            Self::Balanced => CLAUDE_3_SONNET,
            Self::Capable => CLAUDE_3_5_SONNET,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "claude-3-haiku",
            Self::Balanced => "claude-3-sonnet",
            Self::Capable => "claude-3-5-sonnet",
        }
    }
}

/// Which generation strategy serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Direct,
    Agent,
}

impl BackendKind {
    pub fn from_setting(s: &str) -> Self {
        match s {
            "langchain" => Self::Agent,
            _ => Self::Direct,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Agent => "agent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_models_map_to_provider_ids() {
        assert_eq!(
            ModelTier::from_setting("claude-3-haiku").provider_model_id(),
            CLAUDE_3_HAIKU
        );
        assert_eq!(
            ModelTier::from_setting("claude-3-sonnet").provider_model_id(),
            CLAUDE_3_SONNET
        );
        assert_eq!(
            ModelTier::from_setting("claude-3-5-sonnet").provider_model_id(),
            CLAUDE_3_5_SONNET
        );
    }

    #[test]
    fn unrecognized_model_falls_back_to_most_capable() {
        for name in ["gpt-4o", "", "CLAUDE-3-HAIKU"] {
            assert_eq!(ModelTier::from_setting(name), ModelTier::Capable);
        }
    }

    #[test]
    fn framework_selects_backend() {
        let mut settings = Settings {
            model: "claude-3-haiku".to_string(),
            temperature: 0.5,
            system: String::new(),
            framework: None,
        };
        assert_eq!(settings.backend_kind(), BackendKind::Direct);
        settings.framework = Some("langchain".to_string());
        assert_eq!(settings.backend_kind(), BackendKind::Agent);
        settings.framework = Some("other".to_string());
        assert_eq!(settings.backend_kind(), BackendKind::Direct);
    }
}
