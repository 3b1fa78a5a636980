use relay_mcp_client::McpClientError;
use reqwest::StatusCode;
use std::io;
use thiserror::Error;

use crate::store::StoreError;
use crate::validate::ValidationError;

pub type Result<T> = std::result::Result<T, RelayErr>;

#[derive(Error, Debug)]
pub enum RelayErr {
    /// The provider SSE stream disconnected or errored out after the HTTP
    /// handshake succeeded but before the terminal frame. Surfaced to the
    /// client as one canonical `error` event followed by `done{failed}`.
    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    /// Unexpected provider HTTP status; the body is included because the
    /// providers return structured error JSON that is far more useful than
    /// the bare status line.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    #[error("turn interrupted")]
    Interrupted,

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown MCP server: {0}")]
    UnknownServer(String),

    #[error("missing credential for provider `{provider}`: set `{var}`")]
    MissingProviderKey { provider: String, var: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mcp(#[from] McpClientError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RelayErr {
    /// Stable error kind surfaced to clients. Internal detail (stack traces,
    /// subprocess paths) never rides along with the kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayErr::Stream(_)
            | RelayErr::UnexpectedStatus(..)
            | RelayErr::RetryLimit(_)
            | RelayErr::Reqwest(_) => "model:upstream",
            RelayErr::Interrupted => "session:superseded",
            RelayErr::UnknownModel(_) => "validation:unknown-model",
            RelayErr::UnknownServer(_) => "validation:unknown-server",
            RelayErr::MissingProviderKey { .. } => "model:upstream",
            RelayErr::Validation(e) => e.kind(),
            RelayErr::Store(_) => "store:unavailable",
            RelayErr::Mcp(e) => match e {
                McpClientError::Spawn(_) => "mcp:spawn-failed",
                McpClientError::HandshakeTimeout(_) => "mcp:handshake-timeout",
                McpClientError::ToolTimeout(_) => "mcp:tool-timeout",
                McpClientError::ToolRaised(_) => "mcp:tool-raised",
                _ => "mcp:transport",
            },
            RelayErr::Io(_) | RelayErr::Json(_) => "internal",
        }
    }
}
