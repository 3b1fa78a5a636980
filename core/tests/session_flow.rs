//! Agent-session behavior against a mock provider: the tool loop, memory
//! modes, supersession, cooperative stop and idle eviction.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use relay_core::AgentSession;
use relay_core::MemoryMode;
use relay_core::ModelClient;
use relay_core::ModelProviderInfo;
use relay_core::SamplingParams;
use relay_core::McpSupervisor;
use relay_core::SessionManager;
use relay_core::SupervisorTimeouts;
use relay_core::WireApi;
use relay_core::store::ConfigStore;
use relay_core::store::MemoryConfigStore;
use relay_protocol::DoneReason;
use relay_protocol::Message;
use relay_protocol::Role;
use relay_protocol::ServerSpec;
use relay_protocol::StreamEvent;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn provider(base_url: &str) -> ModelProviderInfo {
    ModelProviderInfo {
        name: "Test".to_string(),
        base_url: base_url.to_string(),
        env_key: "PATH".to_string(),
        wire_api: WireApi::Chat,
    }
}

fn supervisor() -> Arc<McpSupervisor> {
    Arc::new(McpSupervisor::new(
        Arc::new(MemoryConfigStore::default()),
        std::env::temp_dir().join("relay-session-tests"),
        SupervisorTimeouts {
            handshake: Duration::from_millis(200),
            tool_call: Duration::from_millis(200),
            drain_window: Duration::from_millis(100),
        },
    ))
}

fn session(base_url: &str, params: SamplingParams) -> Arc<AgentSession> {
    AgentSession::new(
        "u1".to_string(),
        "test-model".to_string(),
        None,
        Vec::new(),
        params,
        ModelClient::new("test-model", provider(base_url)),
        supervisor(),
    )
}

fn text_turn_body(chunks: &[&str]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        let frame = json!({"choices": [{"delta": {"content": chunk}}]});
        body.push_str(&format!("data: {frame}\n\n"));
    }
    let finish = json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
    body.push_str(&format!("data: {finish}\n\ndata: [DONE]\n\n"));
    body
}

fn tool_turn_body(call_id: &str, name: &str, arguments: &str) -> String {
    let open = json!({"choices": [{"delta": {"tool_calls": [
        {"id": call_id, "function": {"name": name, "arguments": arguments}}
    ]}}]});
    let finish = json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]});
    format!("data: {open}\n\ndata: {finish}\n\ndata: [DONE]\n\n")
}

fn sse(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn user(text: &str) -> Message {
    Message::text(Role::User, text)
}

async fn drain(events: relay_core::EventStream) -> Vec<StreamEvent> {
    events.collect().await
}

fn done_reasons(events: &[StreamEvent]) -> Vec<DoneReason> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Done { reason } => Some(*reason),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn plain_turn_streams_text_and_completes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(text_turn_body(&["Hel", "lo"])))
        .expect(1)
        .mount(&server)
        .await;

    let sess = session(&server.uri(), SamplingParams::default());
    let events = drain(sess.clone().converse(
        vec![user("hi")],
        "s1".to_string(),
        CancellationToken::new(),
    ))
    .await;

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello");
    // Exactly one terminal frame, and it is the last event.
    assert_eq!(done_reasons(&events), vec![DoneReason::Complete]);
    assert!(events.last().expect("non-empty").is_terminal());
}

#[tokio::test]
async fn tool_failure_feeds_back_and_the_turn_continues() {
    let server = MockServer::start().await;
    // First provider turn requests a tool on a server the user never
    // registered; the second sees the error result and wraps up.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(tool_turn_body(
            "call_1",
            "ghost__MCP__boom",
            "{}",
        )))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(text_turn_body(&["done"])))
        .expect(1)
        .mount(&server)
        .await;

    let sess = session(&server.uri(), SamplingParams::default());
    let events = drain(sess.clone().converse(
        vec![user("use the tool")],
        "s1".to_string(),
        CancellationToken::new(),
    ))
    .await;

    let tool_result = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ToolResult(result) => Some(result.clone()),
            _ => None,
        })
        .expect("tool result surfaced");
    assert_eq!(tool_result.status, "error");

    assert!(
        events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { delta } if delta == "done"))
    );
    assert_eq!(done_reasons(&events), vec![DoneReason::Complete]);
}

#[tokio::test]
async fn server_memory_resends_the_transcript() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(text_turn_body(&["answer"])))
        .expect(2)
        .mount(&server)
        .await;

    let params = SamplingParams {
        memory_mode: MemoryMode::Server,
        ..SamplingParams::default()
    };
    let sess = session(&server.uri(), params);

    let first = drain(sess.clone().converse(
        vec![user("first question")],
        "s1".to_string(),
        CancellationToken::new(),
    ))
    .await;
    assert_eq!(done_reasons(&first), vec![DoneReason::Complete]);

    let second = drain(sess.clone().converse(
        vec![user("second question")],
        "s2".to_string(),
        CancellationToken::new(),
    ))
    .await;
    assert_eq!(done_reasons(&second), vec![DoneReason::Complete]);

    let requests = server.received_requests().await.expect("requests recorded");
    assert_eq!(requests.len(), 2);
    let second_body: serde_json::Value =
        serde_json::from_slice(&requests[1].body).expect("json body");
    let messages = second_body["messages"].as_array().expect("messages");
    // First user message, first assistant answer, second user message.
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["content"], "first question");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[2]["content"], "second question");
}

#[tokio::test]
async fn newer_stream_supersedes_the_incumbent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(text_turn_body(&["slow answer"])).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let sess = session(&server.uri(), SamplingParams::default());

    let first = sess.clone().converse(
        vec![user("first")],
        "s1".to_string(),
        CancellationToken::new(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = sess.clone().converse(
        vec![user("second")],
        "s2".to_string(),
        CancellationToken::new(),
    );

    let (first_events, second_events) = tokio::join!(drain(first), drain(second));
    assert_eq!(done_reasons(&first_events), vec![DoneReason::Cancelled]);
    assert_eq!(done_reasons(&second_events), vec![DoneReason::Complete]);
}

#[tokio::test]
async fn stop_cancels_at_the_next_suspension_point() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(text_turn_body(&["never seen"])).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let manager = SessionManager::new(Duration::from_secs(60));
    let (stream_id, token) = manager.open_stream();

    let sess = session(&server.uri(), SamplingParams::default());
    let events = sess.clone().converse(vec![user("hi")], stream_id.clone(), token);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.cancel_stream(&stream_id));
    let events = drain(events).await;

    assert_eq!(done_reasons(&events), vec![DoneReason::Cancelled]);
    // No partial assistant output leaked before the terminal frame.
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { .. }))
    );

    // Stop again: the registry entry is gone once the server retires it,
    // and a second stop still reports success at the HTTP layer.
    manager.close_stream(&stream_id);
    assert!(!manager.cancel_stream(&stream_id));
}

#[tokio::test]
async fn idle_sessions_are_evicted_and_rebuilt() {
    let server = MockServer::start().await;
    let manager = SessionManager::new(Duration::from_millis(50));
    let builds = Arc::new(AtomicUsize::new(0));

    let build = |uri: String, builds: Arc<AtomicUsize>| {
        move || {
            let uri = uri.clone();
            let builds = builds.clone();
            async move {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(session(&uri, SamplingParams::default()))
            }
        }
    };

    let first = manager
        .get_or_create("u1", "test-model", build(server.uri(), builds.clone()))
        .await
        .expect("create");
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    // Within the horizon the same session is reused.
    let again = manager
        .get_or_create("u1", "test-model", build(server.uri(), builds.clone()))
        .await
        .expect("reuse");
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    manager.evict_idle().await;

    let rebuilt = manager
        .get_or_create("u1", "test-model", build(server.uri(), builds.clone()))
        .await
        .expect("rebuild");
    assert!(!Arc::ptr_eq(&first, &rebuilt));
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

/// Shell-scripted MCP server: answers the handshake and the first
/// tools/list, then goes to sleep inside tools/call so a dispatch stays
/// suspended for as long as the test needs.
const SLEEPING_MCP_SERVER: &str = r#"read line
printf '%s\n' '{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2025-03-26","capabilities":{},"serverInfo":{"name":"slow","version":"0"}}}'
read line
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"wait","description":"","inputSchema":{"type":"object"}}]}}'
read line
sleep 30
"#;

#[tokio::test]
async fn cancel_during_tool_dispatch_discards_the_whole_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(tool_turn_body("call_1", "slow__MCP__wait", "{}")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(text_turn_body(&["after"])))
        .mount(&server)
        .await;

    // Seeded straight into the store so reconcile spawns it; the `sh`
    // harness stands in for a slow production server.
    let store = Arc::new(MemoryConfigStore::default());
    store
        .put(
            "u1",
            &ServerSpec {
                server_id: "slow".to_string(),
                server_name: "slow".to_string(),
                command: "sh".to_string(),
                args: vec!["-c".to_string(), SLEEPING_MCP_SERVER.to_string()],
                env: HashMap::new(),
            },
        )
        .await
        .expect("seed spec");

    let sup = Arc::new(McpSupervisor::new(
        store,
        std::env::temp_dir().join("relay-session-tests"),
        SupervisorTimeouts {
            handshake: Duration::from_secs(5),
            tool_call: Duration::from_secs(10),
            drain_window: Duration::from_millis(100),
        },
    ));
    let failures = sup.startup_reconcile("u1").await.expect("reconcile");
    assert!(failures.is_empty(), "slow server must come up: {failures:?}");
    let tools = sup
        .tools_for("u1", &["slow".to_string()])
        .await
        .expect("tools");

    let params = SamplingParams {
        memory_mode: MemoryMode::Server,
        ..SamplingParams::default()
    };
    let sess = AgentSession::new(
        "u1".to_string(),
        "test-model".to_string(),
        None,
        tools,
        params,
        ModelClient::new("test-model", provider(&server.uri())),
        sup,
    );

    let token = CancellationToken::new();
    let mut events = sess.clone().converse(
        vec![user("use the tool")],
        "s1".to_string(),
        token.clone(),
    );

    // Read until the argument stream closes; the dispatch that follows is
    // parked inside the sleeping server's tools/call when the cancel lands.
    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        let input_closed = matches!(event, StreamEvent::ToolInputEnd);
        seen.push(event);
        if input_closed {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    token.cancel();
    seen.extend(events.collect::<Vec<_>>().await);

    assert_eq!(done_reasons(&seen), vec![DoneReason::Cancelled]);
    assert!(
        !seen.iter().any(|e| matches!(e, StreamEvent::ToolResult(_))),
        "no result may surface for the abandoned call"
    );

    // The discarded turn must not leak a dangling tool_use into the next
    // upstream request.
    let follow_up = drain(sess.clone().converse(
        vec![user("still there?")],
        "s2".to_string(),
        CancellationToken::new(),
    ))
    .await;
    assert_eq!(done_reasons(&follow_up), vec![DoneReason::Complete]);

    let requests = server.received_requests().await.expect("requests recorded");
    let last_body: serde_json::Value =
        serde_json::from_slice(&requests.last().expect("follow-up request").body)
            .expect("json body");
    let messages = last_body["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], "use the tool");
    assert_eq!(messages[1]["content"], "still there?");
    assert!(
        messages.iter().all(|m| m.get("tool_calls").is_none()),
        "cancelled turn must leave no tool_calls behind"
    );
}
