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

const API_VERSION_HEADER: &str = "anthropic-version";
const API_VERSION: &str = "2023-06-01";

/// Implementation for the block-structured streaming messages dialect: the
/// provider emits discrete `content_block_start/delta/stop` frames which
/// lift directly onto the adapter's event alphabet.
pub(crate) async fn stream_messages(
    prompt: &Prompt,
    model: &str,
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
) -> Result<ModelStream> {
    let messages: Vec<serde_json::Value> = prompt.input.iter().map(wire_message).collect();

    let tools_json: Vec<serde_json::Value> = prompt
        .tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.qualified_name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            })
        })
        .collect();

    let mut payload = json!({
        "model": model,
        "max_tokens": prompt.max_tokens,
        "messages": messages,
        "stream": true,
    });
    if let Some(system) = &prompt.system_prompt {
        payload["system"] = json!(system);
    }
    if !tools_json.is_empty() {
        payload["tools"] = serde_json::Value::Array(tools_json);
    }
    if let Some(temperature) = prompt.temperature {
        payload["temperature"] = json!(temperature);
    }
    if prompt.enable_thinking {
        let budget = prompt.budget_tokens.unwrap_or(1024);
        payload["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
    }

    let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
    debug!(url, "POST messages");
    trace!(
        "payload: {}",
        serde_json::to_string(&payload).unwrap_or_default()
    );

    let resp = client
        .post(&url)
        .header("x-api-key", api_key)
        .header(API_VERSION_HEADER, API_VERSION)
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
    tokio::spawn(process_messages_sse(stream, tx_event));
    Ok(ModelStream { rx_event })
}

fn wire_message(message: &Message) -> serde_json::Value {
    let content = match &message.content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Blocks(blocks) => {
            let parts: Vec<serde_json::Value> = blocks.iter().map(wire_block).collect();
            serde_json::Value::Array(parts)
        }
    };
    json!({"role": message.role.as_str(), "content": content})
}

fn wire_block(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Image { image_url } => {
            // Inline base64 data URLs become base64 sources; anything else
            // is a URL source.
            if let Some(rest) = image_url.strip_prefix("data:") {
                let (media_type, data) = rest
                    .split_once(";base64,")
                    .unwrap_or(("image/png", rest));
                json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": media_type, "data": data},
                })
            } else {
                json!({"type": "image", "source": {"type": "url", "url": image_url}})
            }
        }
        ContentBlock::File {
            data,
            reference,
            media_type,
        } => {
            if let Some(data) = data {
                json!({
                    "type": "document",
                    "source": {
                        "type": "base64",
                        "media_type": media_type.as_deref().unwrap_or("application/pdf"),
                        "data": data,
                    },
                })
            } else {
                let label = reference.as_deref().unwrap_or("attachment");
                json!({"type": "text", "text": format!("[file: {label}]")})
            }
        }
        ContentBlock::ToolUse {
            call_id,
            name,
            arguments,
        } => json!({
            "type": "tool_use",
            "id": call_id,
            "name": name,
            "input": arguments,
        }),
        ContentBlock::ToolResult {
            call_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": call_id,
            "content": content,
            "is_error": is_error,
        }),
    }
}

/// Per-block decoding state. Only one content block is open at a time on
/// this dialect, so a single slot suffices.
enum OpenBlock {
    Text,
    Thinking,
    ToolUse {
        call_id: String,
        name: String,
        input_json: String,
    },
}

async fn process_messages_sse<S>(stream: S, tx_event: mpsc::Sender<Result<ModelEvent>>)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();
    let idle_timeout = *RELAY_STREAM_IDLE_TIMEOUT_MS;

    let mut open_block: Option<OpenBlock> = None;
    let mut stop_reason = StopReason::EndTurn;

    loop {
        let sse = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(sse))) => sse,
            Ok(Some(Err(e))) => {
                let _ = tx_event.send(Err(RelayErr::Stream(e.to_string()))).await;
                return;
            }
            Ok(None) => {
                let _ = tx_event
                    .send(Ok(ModelEvent::Completed { stop_reason }))
                    .await;
                return;
            }
            Err(_) => {
                let _ = tx_event
                    .send(Err(RelayErr::Stream("idle timeout waiting for SSE".into())))
                    .await;
                return;
            }
        };

        let frame: serde_json::Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let kind = frame.get("type").and_then(|t| t.as_str()).unwrap_or("");
        trace!(kind, "messages frame");

        match kind {
            "content_block_start" => {
                let block = frame.get("content_block");
                let block_type = block
                    .and_then(|b| b.get("type"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("");
                match block_type {
                    "text" => open_block = Some(OpenBlock::Text),
                    "thinking" => open_block = Some(OpenBlock::Thinking),
                    "tool_use" => {
                        let call_id = block
                            .and_then(|b| b.get("id"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let name = block
                            .and_then(|b| b.get("name"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let begin = ModelEvent::ToolCallBegin {
                            call_id: call_id.clone(),
                            name: name.clone(),
                        };
                        if tx_event.send(Ok(begin)).await.is_err() {
                            return;
                        }
                        open_block = Some(OpenBlock::ToolUse {
                            call_id,
                            name,
                            input_json: String::new(),
                        });
                    }
                    other => debug!(other, "unrecognized content block type"),
                }
            }
            "content_block_delta" => {
                let delta = frame.get("delta");
                let delta_type = delta
                    .and_then(|d| d.get("type"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("");
                match (delta_type, open_block.as_mut()) {
                    ("text_delta", _) => {
                        if let Some(text) = delta.and_then(|d| d.get("text")).and_then(|t| t.as_str())
                        {
                            if tx_event
                                .send(Ok(ModelEvent::TextDelta(text.to_string())))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    ("thinking_delta", _) => {
                        if let Some(text) = delta
                            .and_then(|d| d.get("thinking"))
                            .and_then(|t| t.as_str())
                        {
                            if tx_event
                                .send(Ok(ModelEvent::ThinkingDelta(text.to_string())))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    ("input_json_delta", Some(OpenBlock::ToolUse { input_json, .. })) => {
                        if let Some(fragment) = delta
                            .and_then(|d| d.get("partial_json"))
                            .and_then(|t| t.as_str())
                        {
                            input_json.push_str(fragment);
                            if tx_event
                                .send(Ok(ModelEvent::ToolInputDelta(fragment.to_string())))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(OpenBlock::ToolUse {
                    call_id,
                    name,
                    input_json,
                }) = open_block.take()
                {
                    let end = ModelEvent::ToolCallEnd {
                        call_id,
                        name,
                        arguments: input_json,
                    };
                    if tx_event.send(Ok(end)).await.is_err() {
                        return;
                    }
                }
            }
            "message_delta" => {
                if let Some("tool_use") = frame
                    .pointer("/delta/stop_reason")
                    .and_then(|v| v.as_str())
                {
                    stop_reason = StopReason::ToolUse;
                }
            }
            "message_stop" => {
                let _ = tx_event
                    .send(Ok(ModelEvent::Completed { stop_reason }))
                    .await;
                return;
            }
            "error" => {
                let message = frame
                    .pointer("/error/message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("provider reported an error");
                let _ = tx_event
                    .send(Err(RelayErr::Stream(message.to_string())))
                    .await;
                return;
            }
            // message_start, ping and unknown frames carry nothing we need.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use pretty_assertions::assert_eq;
    use relay_protocol::Role;

    use super::*;

    #[test]
    fn data_urls_become_base64_sources() {
        let block = ContentBlock::Image {
            image_url: "data:image/jpeg;base64,QUJD".to_string(),
        };
        let wire = wire_block(&block);
        assert_eq!(wire["source"]["type"], "base64");
        assert_eq!(wire["source"]["media_type"], "image/jpeg");
        assert_eq!(wire["source"]["data"], "QUJD");
    }

    #[test]
    fn tool_results_keep_their_error_flag() {
        let block = ContentBlock::ToolResult {
            call_id: "toolu_1".to_string(),
            content: json!("deadline exceeded"),
            is_error: true,
        };
        let wire = wire_block(&block);
        assert_eq!(wire["type"], "tool_result");
        assert_eq!(wire["tool_use_id"], "toolu_1");
        assert_eq!(wire["is_error"], true);
    }

    #[test]
    fn plain_text_messages_stay_strings() {
        let wire = wire_message(&Message::text(Role::User, "hello"));
        assert_eq!(wire["content"], "hello");
        assert_eq!(wire["role"], "user");
    }
}
