use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use relay_mcp_types::CallToolRequestParams;
use relay_mcp_types::CallToolResult;
use relay_mcp_types::ClientCapabilities;
use relay_mcp_types::Implementation;
use relay_mcp_types::InitializeRequestParams;
use relay_mcp_types::InitializeResult;
use relay_mcp_types::JSONRPCMessage;
use relay_mcp_types::JSONRPCNotification;
use relay_mcp_types::JSONRPCRequest;
use relay_mcp_types::ListToolsResult;
use relay_mcp_types::MCP_SCHEMA_VERSION;
use relay_mcp_types::RequestId;
use relay_mcp_types::Tool;
use relay_mcp_types::methods;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::McpClientError;
use crate::error::Result;

/// Size of the writer queue. The queue is the FIFO intent boundary that keeps
/// concurrent callers from interleaving partial frames on the child's stdin.
const OUTGOING_CHANNEL_CAPACITY: usize = 64;

/// Consecutive transport failures tolerated while `Ready` before the client
/// degrades to `Failed`.
const TRANSPORT_RETRY_BUDGET: u32 = 3;

/// Environment variables inherited from the gateway process. Everything else
/// the child sees comes from the validated spec.
const INHERITED_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "SHELL", "TMPDIR", "TERM"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Starting,
    Ready,
    Closing,
    Failed,
    Closed,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::Init => "init",
            ClientState::Starting => "starting",
            ClientState::Ready => "ready",
            ClientState::Closing => "closing",
            ClientState::Failed => "failed",
            ClientState::Closed => "closed",
        }
    }
}

/// Launch parameters for one server process. Callers must have validated
/// the command, args and env before constructing one of these.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Per-user scratch directory used as the child's cwd.
    pub cwd: PathBuf,
}

type PendingMap = Mutex<HashMap<RequestId, oneshot::Sender<Result<serde_json::Value>>>>;

#[derive(Debug)]
pub struct McpClient {
    outgoing_tx: mpsc::Sender<JSONRPCMessage>,
    writer_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    pending: Arc<PendingMap>,
    next_request_id: AtomicI64,
    state: Arc<Mutex<ClientState>>,
    transport_strikes: AtomicU32,
    child: tokio::sync::Mutex<Option<Child>>,
    tools_cache: tokio::sync::Mutex<Option<Vec<Tool>>>,
    default_call_timeout: Duration,
}

impl McpClient {
    /// Spawn the subprocess, run the `initialize` handshake and prime the
    /// tool cache. The whole sequence must finish within
    /// `handshake_timeout`; on expiry or a malformed reply the process is
    /// killed and the error returned.
    pub async fn connect(
        spec: SpawnSpec,
        handshake_timeout: Duration,
        default_call_timeout: Duration,
    ) -> Result<Self> {
        let client = Self::spawn_transport(spec, default_call_timeout)?;
        client.set_state(ClientState::Starting);

        match timeout(handshake_timeout, client.handshake()).await {
            Ok(Ok(())) => {
                client.set_state(ClientState::Ready);
                Ok(client)
            }
            Ok(Err(err)) => {
                client.kill_now().await;
                client.set_state(ClientState::Failed);
                Err(err)
            }
            Err(_) => {
                client.kill_now().await;
                client.set_state(ClientState::Failed);
                Err(McpClientError::HandshakeTimeout(handshake_timeout))
            }
        }
    }

    fn spawn_transport(spec: SpawnSpec, default_call_timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(&spec.cwd).map_err(McpClientError::Spawn)?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for key in INHERITED_ENV_VARS {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        command.envs(&spec.env);

        let mut child = command.spawn().map_err(McpClientError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpClientError::Transport("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpClientError::Transport("child stdout not captured".to_string()))?;

        let (outgoing_tx, mut outgoing_rx) =
            mpsc::channel::<JSONRPCMessage>(OUTGOING_CHANNEL_CAPACITY);
        let (writer_shutdown_tx, mut writer_shutdown_rx) = oneshot::channel::<()>();
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(Mutex::new(ClientState::Init));

        // Writer: drain the FIFO queue onto the child's stdin, one frame per
        // line, flushing after every frame. Dropping `stdin` on exit closes
        // the pipe, which is the stdio-transport disconnect signal.
        tokio::spawn(async move {
            let mut stdin = stdin;
            loop {
                let msg = tokio::select! {
                    _ = &mut writer_shutdown_rx => break,
                    msg = outgoing_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to serialize outgoing frame: {e}");
                        continue;
                    }
                };
                if stdin.write_all(json.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    debug!("stdin writer exiting (pipe closed)");
                    break;
                }
            }
        });

        // Reader: parse stdout lines into frames and route replies to their
        // pending callers. EOF fails every in-flight request.
        let reader_pending = Arc::clone(&pending);
        let reader_state = Arc::clone(&state);
        let reader_outgoing = outgoing_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JSONRPCMessage>(&line) {
                            Ok(msg) => {
                                dispatch_incoming(msg, &reader_pending, &reader_outgoing).await;
                            }
                            Err(e) => warn!("discarding undecodable frame: {e}"),
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }

            let mut state = lock_ignoring_poison(&reader_state);
            if !matches!(*state, ClientState::Closing | ClientState::Closed) {
                *state = ClientState::Failed;
            }
            drop(state);

            let mut pending = lock_ignoring_poison(&reader_pending);
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(McpClientError::Transport(
                    "server closed its stdout".to_string(),
                )));
            }
            debug!("stdout reader finished (EOF)");
        });

        Ok(Self {
            outgoing_tx,
            writer_shutdown: Mutex::new(Some(writer_shutdown_tx)),
            pending,
            next_request_id: AtomicI64::new(0),
            state,
            transport_strikes: AtomicU32::new(0),
            child: tokio::sync::Mutex::new(Some(child)),
            tools_cache: tokio::sync::Mutex::new(None),
            default_call_timeout,
        })
    }

    async fn handshake(&self) -> Result<()> {
        let params = InitializeRequestParams {
            protocol_version: MCP_SCHEMA_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "relay".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = self
            .send_request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                None,
            )
            .await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpClientError::Protocol(format!("malformed initialize reply: {e}")))?;
        debug!(
            server = init.server_info.as_ref().map(|s| s.name.as_str()),
            protocol = %init.protocol_version,
            "initialize handshake complete"
        );

        let notification = JSONRPCNotification::new(methods::NOTIFICATION_INITIALIZED, None);
        self.outgoing_tx
            .send(JSONRPCMessage::Notification(notification))
            .await
            .map_err(|_| McpClientError::Transport("writer queue closed".to_string()))?;

        // The client is only useful once the server has answered tools/list;
        // fetching it here both verifies liveness and primes the cache.
        let tools = self.fetch_tools().await?;
        info!(tool_count = tools.len(), "MCP server ready");
        *self.tools_cache.lock().await = Some(tools);
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        *lock_ignoring_poison(&self.state)
    }

    fn set_state(&self, next: ClientState) {
        *lock_ignoring_poison(&self.state) = next;
    }

    /// Cached tool descriptors; fetched once after the handshake and again
    /// only if the cache was invalidated.
    pub async fn tools(&self) -> Result<Vec<Tool>> {
        let mut cache = self.tools_cache.lock().await;
        if let Some(tools) = cache.as_ref() {
            return Ok(tools.clone());
        }
        let tools = self.fetch_tools().await?;
        *cache = Some(tools.clone());
        Ok(tools)
    }

    async fn fetch_tools(&self) -> Result<Vec<Tool>> {
        let result = self.send_request(methods::TOOLS_LIST, None, None).await?;
        let listed: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| McpClientError::Protocol(format!("malformed tools/list reply: {e}")))?;
        Ok(listed.tools)
    }

    /// Invoke one tool. `arguments` must conform to the tool's input schema;
    /// schema enforcement is the server's job, argument *sanitation* already
    /// happened at registration time.
    pub async fn call_tool(
        &self,
        name: String,
        arguments: Option<serde_json::Value>,
        call_timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        match self.state() {
            ClientState::Ready => {}
            other => return Err(McpClientError::NotReady(other.as_str())),
        }

        let deadline = call_timeout.unwrap_or(self.default_call_timeout);
        let params = CallToolRequestParams { name, arguments };
        let result = self
            .send_request(
                methods::TOOLS_CALL,
                Some(serde_json::to_value(&params)?),
                Some(deadline),
            )
            .await;

        match result {
            Ok(value) => {
                self.transport_strikes.store(0, Ordering::Relaxed);
                serde_json::from_value(value).map_err(|e| {
                    McpClientError::Protocol(format!("malformed tools/call reply: {e}"))
                })
            }
            Err(err) => {
                if err.is_transport() {
                    let strikes = self.transport_strikes.fetch_add(1, Ordering::Relaxed) + 1;
                    if strikes >= TRANSPORT_RETRY_BUDGET {
                        warn!(strikes, "transport retry budget exhausted");
                        self.set_state(ClientState::Failed);
                    }
                }
                Err(err)
            }
        }
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        lock_ignoring_poison(&self.pending).insert(id.clone(), tx);

        let request = JSONRPCRequest::new(id.clone(), method, params);
        if self
            .outgoing_tx
            .send(JSONRPCMessage::Request(request))
            .await
            .is_err()
        {
            lock_ignoring_poison(&self.pending).remove(&id);
            return Err(McpClientError::Transport("writer queue closed".to_string()));
        }

        let reply = match deadline {
            Some(deadline) => match timeout(deadline, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    lock_ignoring_poison(&self.pending).remove(&id);
                    return Err(McpClientError::ToolTimeout(deadline));
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(result) => result,
            Err(_) => Err(McpClientError::Transport(
                "reply channel dropped".to_string(),
            )),
        }
    }

    /// Graceful disconnect: stop accepting intents, give the child a drain
    /// window to exit on its own after stdin closes, then force-kill.
    /// Idempotent; later calls are no-ops.
    pub async fn shutdown(&self, drain_window: Duration) {
        {
            let state = self.state();
            if matches!(state, ClientState::Closing | ClientState::Closed) {
                return;
            }
            self.set_state(ClientState::Closing);
        }

        // Stop the writer; dropping its stdin handle disconnects the
        // transport and well-behaved servers exit on their own.
        if let Some(tx) = lock_ignoring_poison(&self.writer_shutdown).take() {
            let _ = tx.send(());
        }

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match timeout(drain_window, child.wait()).await {
                Ok(Ok(status)) => debug!(?status, "MCP server exited within drain window"),
                Ok(Err(e)) => warn!("error awaiting MCP server exit: {e}"),
                Err(_) => {
                    warn!("drain window expired, killing MCP server");
                    if let Err(e) = child.start_kill() {
                        warn!("failed to kill MCP server: {e}");
                    }
                }
            }
        }
        *guard = None;
        self.set_state(ClientState::Closed);
    }

    async fn kill_now(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.start_kill();
        }
        *guard = None;
    }
}

/// Route one incoming frame. Replies resolve their pending caller; server
/// pings are answered so well-behaved servers keep their health checks
/// green; anything else is logged and dropped.
async fn dispatch_incoming(
    msg: JSONRPCMessage,
    pending: &Arc<PendingMap>,
    outgoing: &mpsc::Sender<JSONRPCMessage>,
) {
    match msg {
        JSONRPCMessage::Response(response) => {
            let entry = lock_ignoring_poison(pending).remove(&response.id);
            match entry {
                Some(tx) => {
                    let _ = tx.send(Ok(response.result));
                }
                None => warn!(id = ?response.id, "reply for unknown request id"),
            }
        }
        JSONRPCMessage::Error(error) => {
            let entry = lock_ignoring_poison(pending).remove(&error.id);
            match entry {
                Some(tx) => {
                    let _ = tx.send(Err(McpClientError::ToolRaised(error.error.message)));
                }
                None => warn!(id = ?error.id, "error for unknown request id"),
            }
        }
        JSONRPCMessage::Request(request) if request.method == methods::PING => {
            let reply = relay_mcp_types::JSONRPCResponse {
                jsonrpc: relay_mcp_types::JSONRPC_VERSION.to_string(),
                id: request.id,
                result: json!({}),
            };
            let _ = outgoing.send(JSONRPCMessage::Response(reply)).await;
        }
        JSONRPCMessage::Request(request) => {
            debug!(method = %request.method, "ignoring server-initiated request");
        }
        JSONRPCMessage::Notification(notification) => {
            debug!(method = %notification.method, "server notification");
        }
    }
}

/// A poisoned pending/state mutex means a transport task panicked; the maps
/// only hold plain data, so continuing with the inner value is sound.
fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn spec_for(program: &str, args: &[&str]) -> SpawnSpec {
        SpawnSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            cwd: std::env::temp_dir().join("relay-mcp-client-tests"),
        }
    }

    #[tokio::test]
    async fn connect_fails_fast_on_missing_program() {
        let err = McpClient::connect(
            spec_for("relay-test-no-such-binary", &[]),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .expect_err("spawn must fail");
        assert_eq!(err.kind(), "spawn-failed");
    }

    #[tokio::test]
    async fn connect_times_out_on_silent_child() {
        // `cat` never answers the initialize request.
        let err = McpClient::connect(
            spec_for("cat", &[]),
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
        .await
        .expect_err("handshake must time out");
        assert_eq!(err.kind(), "handshake-timeout");
    }
}
