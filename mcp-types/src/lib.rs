//! The subset of the Model Context Protocol schema the gateway speaks,
//! together with JSON-RPC 2.0 framing. MCP servers are line-delimited
//! JSON-RPC subprocesses; the client crate owns the transport, this crate
//! owns the shapes.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revision sent in the `initialize` handshake.
pub const MCP_SCHEMA_VERSION: &str = "2025-03-26";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PING: &str = "ping";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

/// A single JSON-RPC frame. Batch framing is intentionally unsupported; no
/// MCP server in the wild batches over stdio and rejecting it early keeps
/// the reader loop simple.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JSONRPCMessage {
    Request(JSONRPCRequest),
    Response(JSONRPCResponse),
    Error(JSONRPCError),
    Notification(JSONRPCNotification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCError {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: JSONRPCErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCErrorDetail {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    /// Server capabilities; the gateway only checks for presence of `tools`.
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub server_info: Option<Implementation>,
}

/// A named, schema-described callable exposed by an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolRequestParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<ToolContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<serde_json::Value>,
}

/// Result content blocks. `Other` absorbs block types the gateway forwards
/// verbatim without interpreting (audio, embedded resources).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(other)]
    Other,
}

impl JSONRPCRequest {
    pub fn new(id: RequestId, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

impl JSONRPCNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Collapse a tool result into one JSON value suitable for splicing back
/// into a model conversation.
pub fn result_content_as_json(result: &CallToolResult) -> serde_json::Value {
    if let Some(structured) = &result.structured_content {
        return structured.clone();
    }
    let blocks: Vec<serde_json::Value> = result
        .content
        .iter()
        .map(|block| match block {
            ToolContentBlock::Text { text } => {
                serde_json::json!({"type": "text", "text": text})
            }
            ToolContentBlock::Image { data, mime_type } => {
                serde_json::json!({"type": "image", "data": data, "mimeType": mime_type})
            }
            ToolContentBlock::Other => serde_json::json!({"type": "unsupported"}),
        })
        .collect();
    serde_json::Value::Array(blocks)
}

pub type EnvMap = HashMap<String, String>;

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn request_ids_accept_strings_and_integers() {
        let s: RequestId = serde_json::from_str(r#""abc""#).expect("string id");
        assert_eq!(s, RequestId::String("abc".to_string()));
        let i: RequestId = serde_json::from_str("7").expect("integer id");
        assert_eq!(i, RequestId::Integer(7));
    }

    #[test]
    fn response_and_error_frames_disambiguate() {
        let response = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;
        match serde_json::from_str::<JSONRPCMessage>(response).expect("frame") {
            JSONRPCMessage::Response(r) => assert_eq!(r.id, RequestId::Integer(1)),
            other => panic!("expected response, got {other:?}"),
        }

        let error = r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"no such method"}}"#;
        match serde_json::from_str::<JSONRPCMessage>(error).expect("frame") {
            JSONRPCMessage::Error(e) => assert_eq!(e.error.code, -32601),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tool_content_degrades_to_other() {
        let result: CallToolResult = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"hi"},{"type":"audio","data":"...","mimeType":"audio/wav"}]}"#,
        )
        .expect("call tool result");
        assert!(matches!(result.content[0], ToolContentBlock::Text { .. }));
        assert!(matches!(result.content[1], ToolContentBlock::Other));
    }
}
