//! JSON-RPC 2.0 envelopes and the MCP payloads this client understands.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ai_agent::ToolDescriptor;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "notifications/initialized";
pub const TOOLS_LIST: &str = "tools/list";
pub const TOOLS_CALL: &str = "tools/call";
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
pub const PING: &str = "ping";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcNotification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An inbound message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A server-to-client request, which needs an answer.
    Request {
        id: Value,
        method: String,
    },
}

impl IncomingMessage {
    pub fn classify(payload: Value) -> Option<Self> {
        let Value::Object(mut map) = payload else {
            return None;
        };
        let method = map
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);
        match (map.remove("id"), method) {
            (Some(id), Some(method)) if !id.is_null() => Some(Self::Request { id, method }),
            (_, Some(method)) => Some(Self::Notification {
                method,
                params: map.remove("params"),
            }),
            (Some(id), None) => {
                let id = response_id(&id)?;
                let outcome = match map.remove("error") {
                    Some(error) => Err(serde_json::from_value(error.clone()).unwrap_or(RpcError {
                        code: 0,
                        message: error.to_string(),
                        data: None,
                    })),
                    None => Ok(map.remove("result").unwrap_or(Value::Null)),
                };
                Some(Self::Response { id, outcome })
            }
            (None, None) => None,
        }
    }
}

fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(num) => num.as_u64(),
        Value::String(text) => text.parse::<u64>().ok(),
        _ => None,
    }
}

/// Answer to a server-initiated request: `ping` is acknowledged, anything else
/// is refused.
pub fn reply_to_server_request(id: Value, method: &str) -> Value {
    if method == PING {
        json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": {}})
    } else {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": {"code": METHOD_NOT_FOUND, "message": format!("method `{method}` not supported")}
        })
    }
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": "agentctl",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "tools": { "listChanged": true }
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolListResponse {
    #[serde(default)]
    pub tools: Vec<RemoteToolDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoteToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,
}

impl From<RemoteToolDescriptor> for ToolDescriptor {
    fn from(remote: RemoteToolDescriptor) -> Self {
        let schema = if remote.input_schema.is_null() {
            json!({"type": "object", "properties": {}})
        } else {
            remote.input_schema
        };
        ToolDescriptor::new(remote.name, remote.description, schema)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResponse {
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub structured_content: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallResponse {
    pub fn text(&self) -> String {
        match (&self.content, &self.structured_content) {
            (Value::Null, Some(structured)) => structured.to_string(),
            (content, _) => extract_text_content(content),
        }
    }
}

/// Flattens MCP content blocks into one string: text blocks are joined with
/// newlines, other blocks are kept as compact JSON.
pub fn extract_text_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => block
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                _ => block.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
