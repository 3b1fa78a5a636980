use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use relay_protocol::ContentBlock;
use relay_protocol::Message;
use relay_protocol::MessageContent;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use crate::client_common::ModelEvent;
use crate::client_common::ModelStream;
use crate::client_common::Prompt;
use crate::client_common::StopReason;
use crate::error::RelayErr;
use crate::error::Result;
use crate::flags::RELAY_STREAM_IDLE_TIMEOUT_MS;

/// Implementation for the incremental-delta chat completions dialect.
pub(crate) async fn stream_chat_completions(
    prompt: &Prompt,
    model: &str,
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
) -> Result<ModelStream> {
    let mut messages = Vec::<serde_json::Value>::new();
    if let Some(system) = &prompt.system_prompt {
        messages.push(json!({"role": "system", "content": system}));
    }
    for message in &prompt.input {
        append_wire_messages(&mut messages, message);
    }

    let tools_json: Vec<serde_json::Value> = prompt
        .tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.qualified_name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect();

    let mut payload = json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "max_tokens": prompt.max_tokens,
    });
    if !tools_json.is_empty() {
        payload["tools"] = serde_json::Value::Array(tools_json);
    }
    if let Some(temperature) = prompt.temperature {
        payload["temperature"] = json!(temperature);
    }

    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    debug!(url, "POST chat completions");
    trace!(
        "payload: {}",
        serde_json::to_string(&payload).unwrap_or_default()
    );

    let resp = client
        .post(&url)
        .bearer_auth(api_key)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(&payload)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(RelayErr::UnexpectedStatus(status, body));
    }

    let (tx_event, rx_event) = mpsc::channel::<Result<ModelEvent>>(16);
    let stream = resp.bytes_stream().map_err(RelayErr::Reqwest);
    tokio::spawn(process_chat_sse(stream, tx_event));
    Ok(ModelStream { rx_event })
}

/// One conversation entry can expand to several wire messages: tool results
/// ride in their own `role: "tool"` messages on this dialect.
fn append_wire_messages(out: &mut Vec<serde_json::Value>, message: &Message) {
    match &message.content {
        MessageContent::Text(text) => {
            out.push(json!({"role": message.role.as_str(), "content": text}));
        }
        MessageContent::Blocks(blocks) => {
            let mut content_parts = Vec::<serde_json::Value>::new();
            let mut tool_calls = Vec::<serde_json::Value>::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        content_parts.push(json!({"type": "text", "text": text}));
                    }
                    ContentBlock::Image { image_url } => {
                        content_parts
                            .push(json!({"type": "image_url", "image_url": {"url": image_url}}));
                    }
                    ContentBlock::File { reference, .. } => {
                        // This dialect has no file part; degrade to a textual
                        // mention so the model at least knows one was sent.
                        let label = reference.as_deref().unwrap_or("inline attachment");
                        content_parts
                            .push(json!({"type": "text", "text": format!("[file: {label}]")}));
                    }
                    ContentBlock::ToolUse {
                        call_id,
                        name,
                        arguments,
                    } => {
                        tool_calls.push(json!({
                            "id": call_id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": arguments.to_string(),
                            }
                        }));
                    }
                    ContentBlock::ToolResult {
                        call_id, content, ..
                    } => {
                        let rendered = match content {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": call_id,
                            "content": rendered,
                        }));
                    }
                }
            }

            if !content_parts.is_empty() || !tool_calls.is_empty() {
                let mut entry = json!({"role": message.role.as_str()});
                entry["content"] = if content_parts.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::Value::Array(content_parts)
                };
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = serde_json::Value::Array(tool_calls);
                }
                out.push(entry);
            }
        }
    }
}

/// State accumulated for a function call that streams in across chunks. The
/// provider splits the `arguments` string over many delta events until the
/// chunk whose `finish_reason` is `tool_calls` arrives.
#[derive(Default)]
struct FunctionCallState {
    name: Option<String>,
    arguments: String,
    call_id: Option<String>,
    active: bool,
}

async fn process_chat_sse<S>(stream: S, tx_event: mpsc::Sender<Result<ModelEvent>>)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();
    let idle_timeout = *RELAY_STREAM_IDLE_TIMEOUT_MS;

    let mut fn_call_state = FunctionCallState::default();
    let mut completed_sent = false;

    loop {
        let sse = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(sse))) => sse,
            Ok(Some(Err(e))) => {
                let _ = tx_event.send(Err(RelayErr::Stream(e.to_string()))).await;
                return;
            }
            Ok(None) => {
                // Stream closed gracefully; treat as end of turn if the
                // provider never sent a finish_reason.
                if !completed_sent {
                    let _ = tx_event
                        .send(Ok(ModelEvent::Completed {
                            stop_reason: StopReason::EndTurn,
                        }))
                        .await;
                }
                return;
            }
            Err(_) => {
                let _ = tx_event
                    .send(Err(RelayErr::Stream("idle timeout waiting for SSE".into())))
                    .await;
                return;
            }
        };

        if sse.data.trim() == "[DONE]" {
            if !completed_sent {
                let _ = tx_event
                    .send(Ok(ModelEvent::Completed {
                        stop_reason: StopReason::EndTurn,
                    }))
                    .await;
            }
            return;
        }

        let chunk: serde_json::Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        trace!("chat chunk: {chunk:?}");

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            continue;
        };

        if let Some(content) = choice
            .pointer("/delta/content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
        {
            if tx_event
                .send(Ok(ModelEvent::TextDelta(content.to_string())))
                .await
                .is_err()
            {
                return;
            }
        }

        // Several chat-compatible providers stream chain-of-thought under
        // `reasoning_content`.
        if let Some(thinking) = choice
            .pointer("/delta/reasoning_content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
        {
            if tx_event
                .send(Ok(ModelEvent::ThinkingDelta(thinking.to_string())))
                .await
                .is_err()
            {
                return;
            }
        }

        if let Some(tool_call) = choice
            .pointer("/delta/tool_calls")
            .and_then(|tc| tc.as_array())
            .and_then(|tc| tc.first())
        {
            let was_active = fn_call_state.active;
            fn_call_state.active = true;

            if let Some(id) = tool_call.get("id").and_then(|v| v.as_str()) {
                fn_call_state.call_id.get_or_insert_with(|| id.to_string());
            }
            let function = tool_call.get("function");
            if let Some(name) = function
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
            {
                fn_call_state.name.get_or_insert_with(|| name.to_string());
            }

            if !was_active {
                let begin = ModelEvent::ToolCallBegin {
                    call_id: fn_call_state.call_id.clone().unwrap_or_default(),
                    name: fn_call_state.name.clone().unwrap_or_default(),
                };
                if tx_event.send(Ok(begin)).await.is_err() {
                    return;
                }
            }

            if let Some(fragment) = function
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
                .filter(|f| !f.is_empty())
            {
                fn_call_state.arguments.push_str(fragment);
                if tx_event
                    .send(Ok(ModelEvent::ToolInputDelta(fragment.to_string())))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }

        if let Some(finish_reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            let stop_reason = match finish_reason {
                "tool_calls" if fn_call_state.active => {
                    let end = ModelEvent::ToolCallEnd {
                        call_id: fn_call_state.call_id.take().unwrap_or_default(),
                        name: fn_call_state.name.take().unwrap_or_default(),
                        arguments: std::mem::take(&mut fn_call_state.arguments),
                    };
                    fn_call_state.active = false;
                    if tx_event.send(Ok(end)).await.is_err() {
                        return;
                    }
                    StopReason::ToolUse
                }
                _ => StopReason::EndTurn,
            };

            completed_sent = true;
            let _ = tx_event
                .send(Ok(ModelEvent::Completed { stop_reason }))
                .await;
            return;
        }
    }
}
