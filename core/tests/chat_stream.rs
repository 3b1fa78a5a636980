//! Provider stream adapters exercised against a mock SSE endpoint.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use futures::StreamExt;
use pretty_assertions::assert_eq;
use relay_core::ModelClient;
use relay_core::ModelEvent;
use relay_core::ModelProviderInfo;
use relay_core::Prompt;
use relay_core::StopReason;
use relay_core::WireApi;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

/// `env_key` points at a variable that is always present so the adapter has
/// a bearer token to send; the mock does not check it.
fn provider(base_url: &str, wire_api: WireApi) -> ModelProviderInfo {
    ModelProviderInfo {
        name: "Test".to_string(),
        base_url: base_url.to_string(),
        env_key: "PATH".to_string(),
        wire_api,
    }
}

fn sse_body(frames: &[serde_json::Value], with_done: bool) -> String {
    let mut body = String::new();
    for frame in frames {
        body.push_str(&format!("data: {frame}\n\n"));
    }
    if with_done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

async fn collect(client: &ModelClient) -> Vec<ModelEvent> {
    let mut stream = client.stream(&Prompt::default()).await.expect("stream");
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event.expect("event"));
    }
    events
}

#[tokio::test]
async fn chat_text_deltas_arrive_in_order() {
    let server = MockServer::start().await;
    let body = sse_body(
        &[
            json!({"choices": [{"delta": {"content": "Hel"}}]}),
            json!({"choices": [{"delta": {"content": "lo"}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
        ],
        true,
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(body))
        .expect(1)
        .mount(&server)
        .await;

    let client = ModelClient::new("test-model", provider(&server.uri(), WireApi::Chat));
    let events = collect(&client).await;

    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], ModelEvent::TextDelta(d) if d == "Hel"));
    assert!(matches!(&events[1], ModelEvent::TextDelta(d) if d == "lo"));
    assert!(matches!(
        &events[2],
        ModelEvent::Completed {
            stop_reason: StopReason::EndTurn
        }
    ));
}

#[tokio::test]
async fn chat_tool_call_fragments_accumulate() {
    let server = MockServer::start().await;
    let body = sse_body(
        &[
            json!({"choices": [{"delta": {"tool_calls": [
                {"id": "call_1", "function": {"name": "fs__MCP__list", "arguments": ""}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"function": {"arguments": "{\"path\":"}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"function": {"arguments": "\"/tmp\"}"}}
            ]}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        ],
        true,
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(body))
        .expect(1)
        .mount(&server)
        .await;

    let client = ModelClient::new("test-model", provider(&server.uri(), WireApi::Chat));
    let events = collect(&client).await;

    assert!(matches!(
        &events[0],
        ModelEvent::ToolCallBegin { call_id, name }
            if call_id == "call_1" && name == "fs__MCP__list"
    ));
    let deltas: String = events
        .iter()
        .filter_map(|e| match e {
            ModelEvent::ToolInputDelta(d) => Some(d.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, "{\"path\":\"/tmp\"}");

    let end = events
        .iter()
        .find_map(|e| match e {
            ModelEvent::ToolCallEnd {
                call_id,
                name,
                arguments,
            } => Some((call_id.clone(), name.clone(), arguments.clone())),
            _ => None,
        })
        .expect("tool call end");
    assert_eq!(end.0, "call_1");
    assert_eq!(end.1, "fs__MCP__list");
    assert_eq!(end.2, "{\"path\":\"/tmp\"}");

    assert!(matches!(
        events.last().expect("terminal"),
        ModelEvent::Completed {
            stop_reason: StopReason::ToolUse
        }
    ));
}

#[tokio::test]
async fn messages_blocks_lift_onto_the_event_alphabet() {
    let server = MockServer::start().await;
    let body = sse_body(
        &[
            json!({"type": "message_start", "message": {"id": "msg_1"}}),
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "thinking", "thinking": ""}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "thinking_delta", "thinking": "hmm"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1,
                   "content_block": {"type": "tool_use", "id": "toolu_1", "name": "fs__MCP__read"}}),
            json!({"type": "content_block_delta", "index": 1,
                   "delta": {"type": "input_json_delta", "partial_json": "{\"path\":\"/tmp/a\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {}}),
            json!({"type": "message_stop"}),
        ],
        false,
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(sse_response(body))
        .expect(1)
        .mount(&server)
        .await;

    let client = ModelClient::new("test-model", provider(&server.uri(), WireApi::Messages));
    let events = collect(&client).await;

    assert!(matches!(&events[0], ModelEvent::ThinkingDelta(d) if d == "hmm"));
    assert!(matches!(
        &events[1],
        ModelEvent::ToolCallBegin { call_id, name }
            if call_id == "toolu_1" && name == "fs__MCP__read"
    ));
    assert!(matches!(&events[2], ModelEvent::ToolInputDelta(d) if d == "{\"path\":\"/tmp/a\"}"));
    assert!(matches!(
        &events[3],
        ModelEvent::ToolCallEnd { arguments, .. } if arguments == "{\"path\":\"/tmp/a\"}"
    ));
    assert!(matches!(
        &events[4],
        ModelEvent::Completed {
            stop_reason: StopReason::ToolUse
        }
    ));
}

#[tokio::test]
async fn non_retryable_status_surfaces_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(400).set_body_string(r#"{"error": "bad tool schema"}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = ModelClient::new("test-model", provider(&server.uri(), WireApi::Chat));
    let err = client
        .stream(&Prompt::default())
        .await
        .expect_err("must fail");
    assert_eq!(err.kind(), "model:upstream");
    assert!(err.to_string().contains("bad tool schema"));
}
