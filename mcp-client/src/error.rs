use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, McpClientError>;

#[derive(Error, Debug)]
pub enum McpClientError {
    #[error("failed to spawn MCP server process: {0}")]
    Spawn(#[source] io::Error),

    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("tool call did not complete within {0:?}")]
    ToolTimeout(Duration),

    /// The subprocess pipe is gone or the server stopped answering at the
    /// transport level. Recurring transport errors degrade the client.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered, but not with anything resembling the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The tool itself reported failure; the connection is healthy.
    #[error("tool raised an error: {0}")]
    ToolRaised(String),

    #[error("client is {0}, not ready")]
    NotReady(&'static str),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl McpClientError {
    /// Stable kind tag surfaced inside `tool_result` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            McpClientError::Spawn(_) => "spawn-failed",
            McpClientError::HandshakeTimeout(_) => "handshake-timeout",
            McpClientError::ToolTimeout(_) => "timeout",
            McpClientError::Transport(_) => "transport",
            McpClientError::Protocol(_) | McpClientError::Json(_) => "protocol",
            McpClientError::ToolRaised(_) => "tool-raised",
            McpClientError::NotReady(_) => "transport",
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            McpClientError::Transport(_) | McpClientError::NotReady(_)
        )
    }
}
