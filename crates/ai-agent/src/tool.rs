use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Loosely typed tool arguments as issued by the model.
pub type ToolArguments = Map<String, Value>;

/// A request/arguments pair shown to the model as a few-shot example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageExample {
    pub request: String,
    pub params: Value,
}

impl UsageExample {
    pub fn new(request: impl Into<String>, params: Value) -> Self {
        Self {
            request: request.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<UsageExample>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            examples: Vec::new(),
        }
    }

    pub fn with_example(mut self, example: UsageExample) -> Self {
        self.examples.push(example);
        self
    }
}

/// Machine-readable reason attached to an error [`ToolResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolErrorCode {
    UnknownTool,
    ProviderUnavailable,
    TransportLost,
    Timeout,
    InvalidArguments,
    ExecutionFailed,
}

impl ToolErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorCode::UnknownTool => "unknown-tool",
            ToolErrorCode::ProviderUnavailable => "provider-unavailable",
            ToolErrorCode::TransportLost => "transport-lost",
            ToolErrorCode::Timeout => "timeout",
            ToolErrorCode::InvalidArguments => "invalid-arguments",
            ToolErrorCode::ExecutionFailed => "execution-failed",
        }
    }
}

impl fmt::Display for ToolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one tool invocation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ToolErrorCode>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            error_code: None,
        }
    }

    pub fn error(code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            error_code: Some(code),
        }
    }

    /// Serializes a status payload; falls back to an error result if the
    /// payload cannot be encoded.
    pub fn json<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_string(payload) {
            Ok(text) => Self::success(text),
            Err(err) => Self::error(
                ToolErrorCode::ExecutionFailed,
                format!("failed to encode tool output: {err}"),
            ),
        }
    }

    /// The `{"result": .., "is_error": ..}` envelope folded into history.
    pub fn envelope(&self) -> String {
        let envelope = FunctionResultEnvelope {
            result: &self.content,
            is_error: self.is_error,
        };
        serde_json::to_string(&envelope).unwrap_or_else(|_| {
            format!(
                "{{\"result\":\"tool output could not be encoded\",\"is_error\":{}}}",
                self.is_error
            )
        })
    }
}

#[derive(Serialize)]
struct FunctionResultEnvelope<'a> {
    result: &'a str,
    is_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Local,
    Subprocess,
    HttpStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectErrorKind {
    SpawnFailed,
    Unreachable,
    AuthRejected,
    Timeout,
    Protocol,
}

impl ConnectErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectErrorKind::SpawnFailed => "spawn-failed",
            ConnectErrorKind::Unreachable => "unreachable",
            ConnectErrorKind::AuthRejected => "auth-rejected",
            ConnectErrorKind::Timeout => "timeout",
            ConnectErrorKind::Protocol => "protocol",
        }
    }
}

/// Why a provider failed to reach its tool server.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {message}", kind.as_str())]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub message: String,
}

impl ConnectError {
    pub fn new(kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(ConnectError),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// One source of tools: the in-process handler or a connection to a tool
/// server.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Human readable category used in the system prompt.
    fn display_name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn status(&self) -> ConnectionStatus;

    /// Establishes the connection. Never retried automatically.
    async fn connect(&self) -> Result<(), ConnectError>;

    async fn disconnect(&self);

    /// Latest discovered catalog; empty unless connected.
    async fn tools(&self) -> Vec<ToolDescriptor>;

    async fn invoke(&self, name: &str, arguments: ToolArguments) -> ToolResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_keeps_content_as_string() {
        let result = ToolResult::success(r#"{"status":"stopped"}"#);
        let envelope: Value = serde_json::from_str(&result.envelope()).unwrap();
        assert_eq!(envelope["result"], json!(r#"{"status":"stopped"}"#));
        assert_eq!(envelope["is_error"], json!(false));
    }

    #[test]
    fn error_codes_use_kebab_case() {
        let code = serde_json::to_string(&ToolErrorCode::ProviderUnavailable).unwrap();
        assert_eq!(code, "\"provider-unavailable\"");
        assert_eq!(ToolErrorCode::UnknownTool.to_string(), "unknown-tool");
    }

    #[test]
    fn connect_error_display_leads_with_kind() {
        let err = ConnectError::new(ConnectErrorKind::SpawnFailed, "no such file");
        assert_eq!(err.to_string(), "spawn-failed: no such file");
    }
}
