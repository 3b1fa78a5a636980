use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

/// Canonical stream alphabet. Within one turn the sequence respects
/// `[thinking_delta*] ([tool_name tool_input_delta* tool_input_end
/// tool_result]* [text_delta*])* done`; `done` is terminal and emitted
/// exactly once per stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Assistant tokens.
    TextDelta { delta: String },

    /// Chain-of-thought tokens; only present when thinking is enabled.
    ThinkingDelta { delta: String },

    /// The tool about to be called. Emitted once per call, before any
    /// argument bytes.
    ToolName { name: String },

    /// Streamed tool-call arguments.
    ToolInputDelta { delta: String },

    /// Distinguished end marker terminating a `tool_input_delta` run.
    ToolInputEnd,

    /// Complete result of the just-finished tool call.
    ToolResult(ToolResultPayload),

    /// Stream error. Non-fatal errors may be followed by further events; a
    /// fatal error is followed by `done`.
    Error(StreamErrorPayload),

    /// Terminal event.
    Done { reason: DoneReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub server_id: String,
    pub tool_name: String,
    /// `"success"` or `"error"`.
    pub status: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamErrorPayload {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Complete,
    Cancelled,
    Failed,
}

impl DoneReason {
    fn finish_reason(self) -> &'static str {
        match self {
            DoneReason::Complete => "stop",
            DoneReason::Cancelled => "cancelled",
            DoneReason::Failed => "failed",
        }
    }
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }

    /// Wraps the event in the provider-shaped wire envelope
    /// `{"choices":[{"delta":{..},"message_extras":{..}}]}` so existing
    /// OpenAI-style browser clients keep working.
    pub fn to_wire_envelope(&self) -> serde_json::Value {
        let choice = match self {
            StreamEvent::TextDelta { delta } => json!({
                "delta": {"role": "assistant", "content": delta},
            }),
            StreamEvent::ThinkingDelta { delta } => json!({
                "delta": {"role": "assistant", "thinking": delta},
            }),
            StreamEvent::ToolName { name } => json!({
                "delta": {},
                "message_extras": {"tool_name": name},
            }),
            StreamEvent::ToolInputDelta { delta } => json!({
                "delta": {},
                "message_extras": {"tool_input": delta},
            }),
            StreamEvent::ToolInputEnd => json!({
                "delta": {},
                "message_extras": {"tool_input_end": true},
            }),
            StreamEvent::ToolResult(result) => json!({
                "delta": {},
                "message_extras": {"tool_result": result},
            }),
            StreamEvent::Error(err) => json!({
                "delta": {},
                "message_extras": {"error": {"kind": err.kind, "message": err.message}},
            }),
            StreamEvent::Done { reason } => json!({
                "delta": {},
                "finish_reason": reason.finish_reason(),
            }),
        };
        json!({"choices": [choice]})
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn text_delta_envelope_is_openai_shaped() {
        let wire = StreamEvent::TextDelta {
            delta: "hi".to_string(),
        }
        .to_wire_envelope();
        assert_eq!(wire["choices"][0]["delta"]["content"], "hi");
    }

    #[test]
    fn done_maps_reasons_to_finish_reason() {
        let complete = StreamEvent::Done {
            reason: DoneReason::Complete,
        }
        .to_wire_envelope();
        assert_eq!(complete["choices"][0]["finish_reason"], "stop");

        let cancelled = StreamEvent::Done {
            reason: DoneReason::Cancelled,
        }
        .to_wire_envelope();
        assert_eq!(cancelled["choices"][0]["finish_reason"], "cancelled");
    }

    #[test]
    fn tool_result_envelope_carries_server_id() {
        let wire = StreamEvent::ToolResult(ToolResultPayload {
            server_id: "fs".to_string(),
            tool_name: "read_file".to_string(),
            status: "success".to_string(),
            content: json!([{"type": "text", "text": "ok"}]),
        })
        .to_wire_envelope();
        assert_eq!(
            wire["choices"][0]["message_extras"]["tool_result"]["server_id"],
            "fs"
        );
    }
}
