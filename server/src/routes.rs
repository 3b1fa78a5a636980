use std::collections::HashMap;

use axum::Json;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use futures::StreamExt;
use relay_core::AgentSession;
use relay_core::MemoryMode;
use relay_core::ModelClient;
use relay_core::SamplingParams;
use relay_core::client_common::EventStream;
use relay_protocol::ChatCompletionRequest;
use relay_protocol::Message;
use relay_protocol::Role;
use relay_protocol::ServerSpec;
use relay_protocol::StreamEvent;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::SharedState;
use crate::auth::UserId;
use crate::error::ApiError;
use crate::sse::sse_response;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub async fn list_models(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let models: Vec<_> = state.config.models.iter().map(|m| m.info()).collect();
    Json(json!({"models": models}))
}

pub async fn list_mcp_servers(
    State(state): State<SharedState>,
    user: UserId,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.supervisor.startup_reconcile(&user.0).await?;
    let servers = state.supervisor.list(&user.0).await?;
    Ok(Json(json!({"servers": servers})))
}

/// Registration body. The launch fields may arrive flat or nested under
/// `config`; after normalization `command` is required.
#[derive(Debug, Deserialize)]
pub struct AddServerRequest {
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub config: Option<NestedServerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct NestedServerConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AddServerRequest {
    fn normalize(self) -> Result<ServerSpec, ApiError> {
        let (command, args, env) = match self.config {
            Some(nested) => (
                nested.command.or(self.command),
                if nested.args.is_empty() {
                    self.args
                } else {
                    nested.args
                },
                if nested.env.is_empty() {
                    self.env
                } else {
                    nested.env
                },
            ),
            None => (self.command, self.args, self.env),
        };
        let command = command.ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "validation:unknown-command",
                "command is required",
            )
        })?;
        Ok(ServerSpec {
            server_id: self.server_id,
            server_name: self.server_name,
            command,
            args,
            env,
        })
    }
}

pub async fn add_mcp_server(
    State(state): State<SharedState>,
    user: UserId,
    Json(request): Json<AddServerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let spec = request.normalize()?;
    let server_id = spec.server_id.clone();
    state.supervisor.startup_reconcile(&user.0).await?;
    state.supervisor.add(&user.0, spec).await?;
    Ok(Json(json!({"status": "ok", "server_id": server_id})))
}

pub async fn remove_mcp_server(
    State(state): State<SharedState>,
    user: UserId,
    Path(server_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.supervisor.remove(&user.0, &server_id).await?;
    Ok(Json(json!({"status": "ok"})))
}

/// Cooperative cancel; stopping a finished or unknown stream is a success so
/// UI state machines stay simple.
pub async fn stop_stream(
    State(state): State<SharedState>,
    _user: UserId,
    Path(stream_id): Path<String>,
) -> Json<serde_json::Value> {
    let was_live = state.sessions.cancel_stream(&stream_id);
    info!(stream_id, was_live, "stop requested");
    Json(json!({"status": "ok"}))
}

pub async fn remove_history(
    State(state): State<SharedState>,
    user: UserId,
) -> Json<serde_json::Value> {
    state.sessions.remove_user_sessions(&user.0).await;
    Json(json!({"status": "ok"}))
}

pub async fn chat_completions(
    State(state): State<SharedState>,
    user: UserId,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    if request.extra_params.use_swarm == Some(true) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "validation:reserved-flag",
            "use_swarm is reserved and not yet supported",
        ));
    }

    let Some((entry, provider)) = state.config.model(&request.model) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "validation:unknown-model",
            format!("`{}` is not an exposed model", request.model),
        ));
    };
    let model_id = entry.model_id.clone();
    let provider = provider.clone();

    state.supervisor.startup_reconcile(&user.0).await?;
    let tools = state
        .supervisor
        .tools_for(&user.0, &request.mcp_server_ids)
        .await?;

    let memory_mode = if request.memory_enabled() {
        MemoryMode::Server
    } else {
        MemoryMode::Client
    };
    let params = SamplingParams {
        max_tokens: request.max_tokens.unwrap_or(4096),
        temperature: request.temperature,
        enable_thinking: request.extra_params.enable_thinking.unwrap_or(false),
        budget_tokens: request.extra_params.budget_tokens,
        only_n_most_recent_images: request.extra_params.only_n_most_recent_images,
        memory_mode,
    };

    let (system_prompt, conversation) = split_system_prompt(request.messages);
    let input = match memory_mode {
        // Server-held history: only the newest user message joins the
        // transcript.
        MemoryMode::Server => conversation
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .cloned()
            .map(|m| vec![m])
            .unwrap_or_default(),
        MemoryMode::Client => conversation,
    };

    let session = {
        let user_id = user.0.clone();
        let supervisor = state.supervisor.clone();
        state
            .sessions
            .get_or_create(&user.0, &request.model, move || async move {
                Ok(AgentSession::new(
                    user_id,
                    model_id.clone(),
                    system_prompt,
                    tools,
                    params,
                    ModelClient::new(&model_id, provider),
                    supervisor,
                ))
            })
            .await?
    };

    let (stream_id, cancel) = state.sessions.open_stream();
    let events = session.converse(input, stream_id.clone(), cancel.clone());

    if request.stream {
        Ok(sse_response(
            state.sessions.clone(),
            stream_id,
            cancel,
            events,
        ))
    } else {
        let response = collect_completion(&state, &request.model, stream_id, events).await?;
        Ok(response.into_response())
    }
}

/// Leading system messages become the session's system prompt; the rest is
/// the conversation proper.
fn split_system_prompt(messages: Vec<Message>) -> (Option<String>, Vec<Message>) {
    let mut system_parts = Vec::new();
    let mut conversation = Vec::new();
    for message in messages {
        if message.role == Role::System {
            system_parts.push(message.text_content());
        } else {
            conversation.push(message);
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };
    (system_prompt, conversation)
}

/// Drain the whole event stream and assemble the non-streaming response
/// body. A failed stream maps to an upstream error status.
async fn collect_completion(
    state: &SharedState,
    model: &str,
    stream_id: String,
    mut events: EventStream,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut text = String::new();
    let mut thinking = String::new();
    let mut tool_results = Vec::new();
    let mut finish_reason = "stop";
    let mut error = None;

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::TextDelta { delta } => text.push_str(&delta),
            StreamEvent::ThinkingDelta { delta } => thinking.push_str(&delta),
            StreamEvent::ToolResult(result) => tool_results.push(result),
            StreamEvent::Error(e) => error = Some(e),
            StreamEvent::Done { reason } => {
                finish_reason = match reason {
                    relay_protocol::DoneReason::Complete => "stop",
                    relay_protocol::DoneReason::Cancelled => "cancelled",
                    relay_protocol::DoneReason::Failed => "failed",
                };
            }
            StreamEvent::ToolName { .. }
            | StreamEvent::ToolInputDelta { .. }
            | StreamEvent::ToolInputEnd => {}
        }
    }
    state.sessions.close_stream(&stream_id);

    if finish_reason == "failed" {
        let (kind, message) = error
            .map(|e| (e.kind, e.message))
            .unwrap_or_else(|| ("model:upstream".to_string(), "stream failed".to_string()));
        return Err(ApiError::new(StatusCode::BAD_GATEWAY, &kind, message));
    }

    let mut extras = json!({"tool_results": tool_results});
    if !thinking.is_empty() {
        extras["thinking"] = json!(thinking);
    }

    Ok(Json(json!({
        "id": stream_id,
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish_reason,
            "message_extras": extras,
        }],
    })))
}
