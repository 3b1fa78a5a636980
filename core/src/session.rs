//! Agent sessions: one bound (user, model, system prompt, tool set) that
//! owns conversational history and exposes `converse` as an event stream.
//!
//! A session has at most one in-flight stream. A second concurrent request
//! supersedes the first: the incumbent's cancellation token is tripped, the
//! newcomer waits for the turn slot, then proceeds. Cancellation is
//! cooperative and observed at the three suspension points of the loop:
//! awaiting the next provider event, awaiting a tool call, and awaiting an
//! event-channel send.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use futures::StreamExt;
use relay_mcp_types::result_content_as_json;
use relay_protocol::ContentBlock;
use relay_protocol::DoneReason;
use relay_protocol::Message;
use relay_protocol::MessageContent;
use relay_protocol::Role;
use relay_protocol::StreamErrorPayload;
use relay_protocol::StreamEvent;
use relay_protocol::ToolResultPayload;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::ModelClient;
use crate::client_common::EventStream;
use crate::client_common::MemoryMode;
use crate::client_common::ModelEvent;
use crate::client_common::Prompt;
use crate::client_common::SamplingParams;
use crate::client_common::StopReason;
use crate::error::RelayErr;
use crate::history::ConversationHistory;
use crate::supervisor::McpSupervisor;
use crate::supervisor::QualifiedTool;
use crate::supervisor::try_parse_fully_qualified_tool_name;
use crate::util::lock_ignoring_poison;

/// Canonical events queued between the agent loop and the SSE writer.
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct ActiveStream {
    stream_id: String,
    cancel: CancellationToken,
}

pub struct AgentSession {
    user_id: String,
    model_id: String,
    system_prompt: Option<String>,
    tools: Vec<QualifiedTool>,
    params: SamplingParams,
    client: ModelClient,
    supervisor: Arc<McpSupervisor>,

    history: Mutex<ConversationHistory>,
    /// Held for the whole of one turn; superseders queue here after
    /// cancelling the incumbent.
    turn_lock: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveStream>>,
    last_activity: Mutex<Instant>,
}

/// Why the agent loop stopped early.
enum RunError {
    Cancelled,
    Fatal(RelayErr),
}

/// A tool call with fully accumulated arguments, ready to dispatch.
struct CompletedToolCall {
    call_id: String,
    name: String,
    arguments: String,
}

impl AgentSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: String,
        model_id: String,
        system_prompt: Option<String>,
        tools: Vec<QualifiedTool>,
        params: SamplingParams,
        client: ModelClient,
        supervisor: Arc<McpSupervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            model_id,
            system_prompt,
            tools,
            params,
            client,
            supervisor,
            history: Mutex::new(ConversationHistory::new()),
            turn_lock: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn touch(&self) {
        *lock_ignoring_poison(&self.last_activity) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock_ignoring_poison(&self.last_activity).elapsed()
    }

    /// Trip the active stream's token, if any. Idempotent.
    pub fn cancel_active(&self) {
        if let Some(active) = lock_ignoring_poison(&self.active).as_ref() {
            active.cancel.cancel();
        }
    }

    pub fn has_active_stream(&self) -> bool {
        lock_ignoring_poison(&self.active).is_some()
    }

    /// Run one conversational turn. The returned stream yields canonical
    /// events and always terminates with exactly one `done`.
    pub fn converse(
        self: Arc<Self>,
        input: Vec<Message>,
        stream_id: String,
        cancel: CancellationToken,
    ) -> EventStream {
        let (tx_event, rx_event) = mpsc::channel::<StreamEvent>(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            self.run_stream(input, stream_id, cancel, tx_event).await;
        });
        EventStream::new(rx_event)
    }

    async fn run_stream(
        self: Arc<Self>,
        input: Vec<Message>,
        stream_id: String,
        cancel: CancellationToken,
        tx_event: mpsc::Sender<StreamEvent>,
    ) {
        self.touch();

        // Supersede: trip the incumbent, then queue on the turn slot. The
        // incumbent unwinds at its next suspension point and releases the
        // lock; UI stop buttons that lost the race are covered by the same
        // path.
        let superseded = {
            let active = lock_ignoring_poison(&self.active);
            if let Some(active) = active.as_ref() {
                active.cancel.cancel();
                true
            } else {
                false
            }
        };
        if superseded {
            info!(
                user_id = self.user_id,
                model_id = self.model_id,
                "superseding active stream"
            );
        }

        let turn_guard = self.turn_lock.lock().await;
        *lock_ignoring_poison(&self.active) = Some(ActiveStream {
            stream_id: stream_id.clone(),
            cancel: cancel.clone(),
        });

        let outcome = self.drive_turns(input, &cancel, &tx_event).await;

        {
            let mut active = lock_ignoring_poison(&self.active);
            if active
                .as_ref()
                .is_some_and(|a| a.stream_id == stream_id)
            {
                *active = None;
            }
        }
        drop(turn_guard);
        self.touch();

        let done = match outcome {
            Ok(()) => StreamEvent::Done {
                reason: DoneReason::Complete,
            },
            Err(RunError::Cancelled) => StreamEvent::Done {
                reason: DoneReason::Cancelled,
            },
            Err(RunError::Fatal(e)) => {
                warn!(stream_id, "stream failed: {e}");
                let _ = tx_event
                    .send(StreamEvent::Error(StreamErrorPayload {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    }))
                    .await;
                StreamEvent::Done {
                    reason: DoneReason::Failed,
                }
            }
        };
        let _ = tx_event.send(done).await;
    }

    async fn drive_turns(
        &self,
        input: Vec<Message>,
        cancel: &CancellationToken,
        tx_event: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), RunError> {
        {
            let mut history = lock_ignoring_poison(&self.history);
            match self.params.memory_mode {
                // The caller sent the full trusted transcript.
                MemoryMode::Client => history.replace(input),
                // The session's own history plus the newest message(s).
                MemoryMode::Server => history.extend(input),
            }
        }

        loop {
            let prompt = self.build_prompt();

            let stream = tokio::select! {
                _ = cancel.cancelled() => return Err(RunError::Cancelled),
                res = self.client.stream(&prompt) => res.map_err(RunError::Fatal)?,
            };
            let mut stream = stream;

            let mut turn_text = String::new();
            let mut tool_calls: Vec<CompletedToolCall> = Vec::new();
            let mut stop_reason = StopReason::EndTurn;

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return Err(RunError::Cancelled),
                    event = stream.next() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let event = event.map_err(RunError::Fatal)?;

                match event {
                    ModelEvent::TextDelta(delta) => {
                        turn_text.push_str(&delta);
                        self.emit(tx_event, StreamEvent::TextDelta { delta }).await?;
                    }
                    ModelEvent::ThinkingDelta(delta) => {
                        if self.params.enable_thinking {
                            self.emit(tx_event, StreamEvent::ThinkingDelta { delta })
                                .await?;
                        }
                    }
                    ModelEvent::ToolCallBegin { name, .. } => {
                        self.emit(tx_event, StreamEvent::ToolName { name }).await?;
                    }
                    ModelEvent::ToolInputDelta(delta) => {
                        self.emit(tx_event, StreamEvent::ToolInputDelta { delta })
                            .await?;
                    }
                    ModelEvent::ToolCallEnd {
                        call_id,
                        name,
                        arguments,
                    } => {
                        self.emit(tx_event, StreamEvent::ToolInputEnd).await?;
                        tool_calls.push(CompletedToolCall {
                            call_id,
                            name,
                            arguments,
                        });
                    }
                    ModelEvent::Completed {
                        stop_reason: reason,
                    } => {
                        stop_reason = reason;
                        break;
                    }
                }
            }

            let assistant = assistant_message(&turn_text, &tool_calls);

            if tool_calls.is_empty() || stop_reason != StopReason::ToolUse {
                if let Some(assistant) = assistant {
                    lock_ignoring_poison(&self.history).push(assistant);
                }
                return Ok(());
            }

            // History only ever sees whole turns. The assistant message and
            // its tool results are buffered and committed together once
            // every call has an answer; cancellation mid-dispatch discards
            // the lot, so the transcript never carries a tool_use block
            // without its matching result.
            let mut records = Vec::with_capacity(tool_calls.len());
            for call in tool_calls {
                if cancel.is_cancelled() {
                    return Err(RunError::Cancelled);
                }
                let (payload, record) = self.dispatch_tool_call(call, cancel).await?;
                self.emit(tx_event, StreamEvent::ToolResult(payload)).await?;
                records.push(record);
            }

            {
                let mut history = lock_ignoring_poison(&self.history);
                if let Some(assistant) = assistant {
                    history.push(assistant);
                }
                history.extend(records);
            }
            // Loop around: the provider sees the tool results as fresh
            // context and continues the turn.
        }
    }

    fn build_prompt(&self) -> Prompt {
        let input = {
            let mut history = lock_ignoring_poison(&self.history);
            if let Some(n) = self.params.only_n_most_recent_images {
                history.elide_images_beyond(n);
            }
            history.contents()
        };
        Prompt {
            system_prompt: self.system_prompt.clone(),
            input,
            tools: self.tools.clone(),
            max_tokens: self.params.max_tokens,
            temperature: self.params.temperature,
            enable_thinking: self.params.enable_thinking,
            budget_tokens: self.params.budget_tokens,
        }
    }

    /// Route one completed tool call through the supervisor. Tool failures
    /// never abort the stream: they surface as error-flagged results so the
    /// model can react.
    async fn dispatch_tool_call(
        &self,
        call: CompletedToolCall,
        cancel: &CancellationToken,
    ) -> Result<(ToolResultPayload, Message), RunError> {
        let parsed = try_parse_fully_qualified_tool_name(&call.name);
        let (server_id, tool_name) = match parsed {
            Some(parts) => parts,
            None => {
                debug!(name = call.name, "model referenced an unqualified tool");
                return Ok(error_result(
                    &call,
                    "unknown-tool",
                    format!("`{}` does not name a registered tool", call.name),
                ));
            }
        };

        let arguments = if call.arguments.trim().is_empty() {
            None
        } else {
            match serde_json::from_str::<serde_json::Value>(&call.arguments) {
                Ok(value) => Some(value),
                Err(e) => {
                    return Ok(error_result(
                        &call,
                        "bad-arguments",
                        format!("tool arguments are not valid JSON: {e}"),
                    ));
                }
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            res = self.supervisor.call_tool(
                &self.user_id,
                &server_id,
                &tool_name,
                arguments,
                None,
            ) => res,
        };

        Ok(match result {
            Ok(result) => {
                let is_error = result.is_error.unwrap_or(false);
                let content = result_content_as_json(&result);
                let payload = ToolResultPayload {
                    server_id: server_id.clone(),
                    tool_name: tool_name.clone(),
                    status: if is_error { "error" } else { "success" }.to_string(),
                    content: content.clone(),
                };
                let record = Message {
                    role: Role::User,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        call_id: call.call_id,
                        content,
                        is_error,
                    }]),
                };
                (payload, record)
            }
            Err(e) => {
                warn!(server_id, tool_name, "tool call failed: {e}");
                let kind = e.kind();
                let payload = ToolResultPayload {
                    server_id: server_id.clone(),
                    tool_name: tool_name.clone(),
                    status: "error".to_string(),
                    content: serde_json::json!({"kind": kind, "message": format!("tool call failed ({kind})")}),
                };
                let record = Message {
                    role: Role::User,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        call_id: call.call_id,
                        content: payload.content.clone(),
                        is_error: true,
                    }]),
                };
                (payload, record)
            }
        })
    }

    /// Forward one canonical event; a dropped receiver means the client went
    /// away, which collapses into the cancellation path.
    async fn emit(
        &self,
        tx_event: &mpsc::Sender<StreamEvent>,
        event: StreamEvent,
    ) -> Result<(), RunError> {
        tx_event
            .send(event)
            .await
            .map_err(|_| RunError::Cancelled)
    }
}

fn assistant_message(turn_text: &str, tool_calls: &[CompletedToolCall]) -> Option<Message> {
    if turn_text.is_empty() && tool_calls.is_empty() {
        return None;
    }
    if tool_calls.is_empty() {
        return Some(Message::text(Role::Assistant, turn_text));
    }

    let mut blocks = Vec::new();
    if !turn_text.is_empty() {
        blocks.push(ContentBlock::Text {
            text: turn_text.to_string(),
        });
    }
    for call in tool_calls {
        let arguments = serde_json::from_str(&call.arguments)
            .unwrap_or(serde_json::Value::String(call.arguments.clone()));
        blocks.push(ContentBlock::ToolUse {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            arguments,
        });
    }
    Some(Message {
        role: Role::Assistant,
        content: MessageContent::Blocks(blocks),
    })
}

fn error_result(
    call: &CompletedToolCall,
    kind: &str,
    message: String,
) -> (ToolResultPayload, Message) {
    let content = serde_json::json!({"kind": kind, "message": message});
    let payload = ToolResultPayload {
        server_id: String::new(),
        tool_name: call.name.clone(),
        status: "error".to_string(),
        content: content.clone(),
    };
    let record = Message {
        role: Role::User,
        content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
            call_id: call.call_id.clone(),
            content,
            is_error: true,
        }]),
    };
    (payload, record)
}
