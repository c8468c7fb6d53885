use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::conversation::{ConversationTurn, FunctionCall};
use crate::tool::{ToolDescriptor, UsageExample};

pub const DEFAULT_MODEL: &str = "GigaChat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub repetition_penalty: Option<f32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_tokens: Some(2048),
            repetition_penalty: Some(1.0),
        }
    }
}

impl SamplingParams {
    /// Copy with every value clamped into the range the backend accepts.
    pub fn validated(&self) -> Self {
        Self {
            model: self.model.clone(),
            temperature: self.temperature.map(|v| v.clamp(0.0, 2.0)),
            top_p: self.top_p.map(|v| v.clamp(0.0, 1.0)),
            max_tokens: self.max_tokens.map(|v| v.clamp(1, 8192)),
            repetition_penalty: self.repetition_penalty.map(|v| v.clamp(0.0, 2.0)),
        }
    }
}

/// Backend-facing shape of one catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub few_shot_examples: Vec<UsageExample>,
}

impl From<&ToolDescriptor> for FunctionDeclaration {
    fn from(descriptor: &ToolDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            parameters: descriptor.input_schema.clone(),
            few_shot_examples: descriptor.examples.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Full history for this call, system prompt first when present.
    pub messages: Vec<ConversationTurn>,
    pub functions: Vec<FunctionDeclaration>,
    pub sampling: SamplingParams,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageModelUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    FunctionCall,
    Length,
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub function_call: Option<FunctionCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendChoice {
    pub message: BackendMessage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguageModelResponse {
    pub choices: Vec<BackendChoice>,
    #[serde(default)]
    pub usage: Option<LanguageModelUsage>,
}

impl LanguageModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            choices: vec![BackendChoice {
                message: BackendMessage {
                    content: Some(text.into()),
                    function_call: None,
                },
                finish_reason: FinishReason::Stop,
            }],
            usage: None,
        }
    }

    pub fn function_call(call: FunctionCall) -> Self {
        Self {
            choices: vec![BackendChoice {
                message: BackendMessage {
                    content: None,
                    function_call: Some(call),
                },
                finish_reason: FinishReason::FunctionCall,
            }],
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: LanguageModelUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("backend rejected credentials: {0}")]
    Unauthorized(String),
    #[error("backend returned an unreadable response: {0}")]
    Decode(String),
}

/// The language-model backend. Its wire schema is owned by the implementor.
#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    async fn send(&self, request: BackendRequest) -> Result<LanguageModelResponse, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validated_clamps_out_of_range_values() {
        let params = SamplingParams {
            model: "GigaChat-Pro".into(),
            temperature: Some(3.5),
            top_p: Some(-1.0),
            max_tokens: Some(0),
            repetition_penalty: None,
        }
        .validated();
        assert_eq!(params.model, "GigaChat-Pro");
        assert_eq!(params.temperature, Some(2.0));
        assert_eq!(params.top_p, Some(0.0));
        assert_eq!(params.max_tokens, Some(1));
        assert_eq!(params.repetition_penalty, None);
    }

    #[test]
    fn declarations_forward_examples_verbatim() {
        let descriptor = ToolDescriptor::new("t", "desc", json!({"type": "object"})).with_example(
            UsageExample::new("do it", json!({"a": 1})),
        );
        let declaration = FunctionDeclaration::from(&descriptor);
        assert_eq!(declaration.few_shot_examples, descriptor.examples);
        let value = serde_json::to_value(&declaration).unwrap();
        assert_eq!(value["few_shot_examples"][0]["request"], json!("do it"));
    }

    #[test]
    fn unknown_finish_reasons_are_preserved() {
        let reason: FinishReason = serde_json::from_value(json!("blacklist")).unwrap();
        assert_eq!(reason, FinishReason::Other("blacklist".into()));
        let reason: FinishReason = serde_json::from_value(json!("function_call")).unwrap();
        assert_eq!(reason, FinishReason::FunctionCall);
    }
}
