use crate::upstream::ToolSpec;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub const WEATHER_CONDITIONS: [&str; 5] = ["sunny", "cloudy", "rainy", "snowy", "windy"];

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, args: &Value) -> Result<Value, ToolError>;
}

/// Where a tool's result comes from.
#[derive(Clone)]
pub enum ExecutionSite {
    Server(Arc<dyn ToolExecutor>),
    /// The caller collects a yes/no answer from its user.
    ClientConfirm,
    ClientAuto,
}

impl ExecutionSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server(_) => "server",
            Self::ClientConfirm => "client_confirm",
            Self::ClientAuto => "client_auto",
        }
    }
}

impl std::fmt::Debug for ExecutionSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub site: ExecutionSite,
}

impl ToolDefinition {
    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: Vec<ToolDefinition>,
}

impl ToolSet {
    pub fn new(tools: Vec<ToolDefinition>) -> Self {
        Self { tools }
    }

    pub fn find(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(ToolDefinition::spec).collect()
    }
}

#[derive(Deserialize)]
struct CityArgs {
    city: String,
}

fn city_from(tool: &str, args: &Value) -> Result<String, ToolError> {
    serde_json::from_value::<CityArgs>(args.clone())
        .map(|a| a.city)
        .map_err(|err| ToolError::InvalidArguments {
            tool: tool.to_string(),
            message: err.to_string(),
        })
}

struct RandomWeather;

#[async_trait]
impl ToolExecutor for RandomWeather {
    async fn execute(&self, args: &Value) -> Result<Value, ToolError> {
        city_from("getWeatherInformation", args)?;
        let pick = (uuid::Uuid::new_v4().as_u128() % WEATHER_CONDITIONS.len() as u128) as usize;
        Ok(Value::String(WEATHER_CONDITIONS[pick].to_string()))
    }
}

struct SunnyWeather;

#[async_trait]
impl ToolExecutor for SunnyWeather {
    async fn execute(&self, args: &Value) -> Result<Value, ToolError> {
        let city = city_from("weather_tool", args)?;
        Ok(Value::String(format!("The weather in {city} is sunny")))
    }
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

/// Tools offered by the direct streaming backend.
pub fn direct_tools() -> ToolSet {
    ToolSet::new(vec![
        ToolDefinition {
            name: "getWeatherInformation".to_string(),
            description: "Show the weather in a given city to the user".to_string(),
            parameters: object_schema(json!({ "city": { "type": "string" } }), &["city"]),
            site: ExecutionSite::Server(Arc::new(RandomWeather)),
        },
        ToolDefinition {
            name: "askForConfirmation".to_string(),
            description: "Ask the user for confirmation.".to_string(),
            parameters: object_schema(
                json!({ "message": {
                    "type": "string",
                    "description": "The message to ask for confirmation."
                } }),
                &["message"],
            ),
            site: ExecutionSite::ClientConfirm,
        },
        ToolDefinition {
            name: "getLocation".to_string(),
            description: "Get the user location. Always ask for confirmation before using this tool."
                .to_string(),
            parameters: object_schema(
                json!({ "consent": {
                    "type": "boolean",
                    "description": "The user consent to use the location."
                } }),
                &["consent"],
            ),
            site: ExecutionSite::ClientAuto,
        },
    ])
}

/// Tools available to the agent loop.
pub fn agent_tools() -> ToolSet {
    ToolSet::new(vec![ToolDefinition {
        name: "weather_tool".to_string(),
        description: "Get the weather for a city".to_string(),
        parameters: object_schema(
            json!({ "city": {
                "type": "string",
                "description": "The city to get the weather for"
            } }),
            &["city"],
        ),
        site: ExecutionSite::Server(Arc::new(SunnyWeather)),
    }])
}
