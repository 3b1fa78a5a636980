use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// User-supplied declaration of one MCP server. Only validated specs are
/// ever persisted or executed; validation lives in the core crate so this
/// stays plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub server_id: String,

    /// Human-readable label.
    #[serde(default)]
    pub server_name: String,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Derived connection status; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Registered,
    Connecting,
    Ready,
    Failed,
}

/// One row of `GET /v1/list/mcp_server`: the persisted spec annotated with
/// the live status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSummary {
    pub server_id: String,
    pub server_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub status: ServerStatus,
}
