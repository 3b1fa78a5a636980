use serde::Deserialize;
use serde::Serialize;

use crate::models::Message;

/// Body of `POST /v1/chat/completions`. Unknown fields are ignored so older
/// browser clients keep working.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<Message>,

    pub model: String,

    /// Subset of the caller's registered MCP server ids to enable for this
    /// turn. Empty means no tools.
    #[serde(default)]
    pub mcp_server_ids: Vec<String>,

    #[serde(default)]
    pub stream: bool,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub temperature: Option<f32>,

    /// Memory-mode selector: when true the server holds conversation history
    /// between requests and the client sends only the newest message.
    /// `keep_session` is the legacy alias.
    #[serde(default)]
    pub use_memory: Option<bool>,

    #[serde(default)]
    pub keep_session: Option<bool>,

    #[serde(default)]
    pub extra_params: ExtraParams,
}

impl ChatCompletionRequest {
    pub fn memory_enabled(&self) -> bool {
        self.use_memory.or(self.keep_session).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtraParams {
    #[serde(default)]
    pub only_n_most_recent_images: Option<usize>,

    #[serde(default)]
    pub budget_tokens: Option<u32>,

    #[serde(default)]
    pub enable_thinking: Option<bool>,

    /// Reserved; requests setting this to true are rejected until the
    /// semantics is settled.
    #[serde(default)]
    pub use_swarm: Option<bool>,
}

/// One entry of `GET /v1/list/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub model_name: String,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    #[test]
    fn minimal_request_parses() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model": "m1", "messages": [{"role": "user", "content": "hi"}]}"#,
        )
        .expect("deserialize request");
        assert!(!req.stream);
        assert!(!req.memory_enabled());
        assert!(req.mcp_server_ids.is_empty());
        assert!(req.extra_params.use_swarm.is_none());
    }

    #[test]
    fn keep_session_is_a_memory_alias() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model": "m1", "messages": [], "keep_session": true}"#,
        )
        .expect("deserialize request");
        assert!(req.memory_enabled());

        // use_memory wins over keep_session when both are present.
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model": "m1", "messages": [], "keep_session": true, "use_memory": false}"#,
        )
        .expect("deserialize request");
        assert!(!req.memory_enabled());
    }
}
