use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool::ToolArguments;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

/// A model-requested tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Arguments as a string-keyed map. Backends that deliver the payload as
    /// an encoded JSON string are decoded first; a missing or blank payload
    /// is an empty map. Anything else that is not an object is rejected.
    pub fn argument_map(&self) -> Result<ToolArguments, String> {
        match &self.arguments {
            Value::Object(map) => Ok(map.clone()),
            Value::Null => Ok(ToolArguments::new()),
            Value::String(raw) if raw.trim().is_empty() => Ok(ToolArguments::new()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(other) => Err(format!("arguments must be a JSON object, got {other}")),
                Err(err) => Err(format!("arguments are not valid JSON: {err}")),
            },
            other => Err(format!("arguments must be a JSON object, got {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ConversationTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_call(call: FunctionCall) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            function_call: Some(call),
            name: None,
        }
    }

    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Function,
            content: Some(content.into()),
            function_call: None,
            name: Some(name.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            function_call: None,
            name: None,
        }
    }
}

/// Checks that every `function` turn directly follows the `assistant` turn
/// carrying the call it answers. Returns the index of the first offending
/// turn.
pub fn find_unpaired_function_turn(turns: &[ConversationTurn]) -> Option<usize> {
    turns.iter().enumerate().find_map(|(idx, turn)| {
        if turn.role != Role::Function {
            return None;
        }
        let paired = idx
            .checked_sub(1)
            .and_then(|prev| turns.get(prev))
            .and_then(|prev| {
                (prev.role == Role::Assistant)
                    .then_some(prev.function_call.as_ref())
                    .flatten()
            })
            .map_or(false, |call| turn.name.as_deref() == Some(call.name.as_str()));
        (!paired).then_some(idx)
    })
}
