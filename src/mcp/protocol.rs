//! JSON-RPC envelope spoken to remote tool servers.
//!
//! Requests carry monotonically increasing integer ids starting at 1 per
//! connection; notifications omit the id and receive no response.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::constants::PROTOCOL_VERSION;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The id as the integer we allocated, when it is one.
    pub fn request_id(&self) -> Option<i64> {
        self.id.as_ref().and_then(Value::as_i64)
    }

    pub fn into_result(self) -> Result<Value, String> {
        if let Some(error) = self.error {
            return Err(format_rpc_error(&error));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Interprets a decoded frame as a response to one of our requests.
///
/// Frames carrying a `method` are server-initiated requests or
/// notifications; frames without an id or without result/error are
/// malformed as responses. Both kinds return `None` and are discarded
/// by the reader.
pub fn parse_response(value: Value) -> Option<JsonRpcResponse> {
    if value.get("method").is_some() {
        return None;
    }
    let object = value.as_object()?;
    if !object.contains_key("id") {
        return None;
    }
    if !object.contains_key("result") && !object.contains_key("error") {
        return None;
    }
    serde_json::from_value(value).ok()
}

fn format_rpc_error(error: &JsonRpcError) -> String {
    let mut output = format!("Server error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| data.as_str().map(str::to_string));
        if let Some(details) = details {
            if !details.is_empty() {
                output.push_str(": ");
                output.push_str(&details);
            }
        }
    }
    output
}

/// One tool as described by a remote server's `tools/list` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "default_input_schema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

pub fn parse_tool_list(result: Value) -> Result<Vec<RemoteToolInfo>, String> {
    let tools = result
        .get("tools")
        .cloned()
        .ok_or_else(|| "Tool listing response is missing 'tools'.".to_string())?;
    serde_json::from_value(tools).map_err(|err| err.to_string())
}

/// Renders a `tools/call` result by concatenating its text content items;
/// a result with no text items is serialized whole.
pub fn render_tool_content(result: &Value) -> String {
    let text_items: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if text_items.is_empty() {
        serde_json::to_string(result).unwrap_or_else(|_| result.to_string())
    } else {
        text_items.join("\n")
    }
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": "agentry",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {},
    })
}

pub fn call_tool_params(name: &str, arguments: &Map<String, Value>) -> Value {
    json!({
        "name": name,
        "arguments": Value::Object(arguments.clone()),
    })
}
