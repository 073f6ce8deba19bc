//! Byte-stream transport over a spawned child process.
//!
//! A single reader task owns the child's stdout and resolves each decoded
//! response against a shared correlation table keyed by request id, so
//! requests may complete in any order relative to their submission. The
//! child's stderr is drained continuously and logged at debug level.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::config::McpServerConfig;
use crate::core::constants::DEFAULT_REQUEST_TIMEOUT_SECONDS;
use crate::mcp::framing;
use crate::mcp::protocol::{
    initialize_params, parse_response, parse_tool_list, render_tool_content, JsonRpcRequest,
    JsonRpcResponse, RemoteToolInfo, METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_LIST_TOOLS,
};

use super::McpTransport;

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct StdioClient {
    config: McpServerConfig,
    inner: tokio::sync::Mutex<Option<StdioConnection>>,
}

struct StdioConnection {
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    pending: PendingMap,
    next_request_id: Arc<AtomicI64>,
    child: Option<Child>,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioClient {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            inner: tokio::sync::Mutex::new(None),
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.config
                .timeout_seconds
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        )
    }

    async fn spawn_connection(&self) -> Result<StdioConnection, String> {
        let program = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| format!("Server '{}' has no launch command.", self.config.id))?;

        let mut command = Command::new(program);
        if let Some(args) = &self.config.args {
            command.args(args);
        }
        if let Some(env) = &self.config.env {
            command.envs(env);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| format!("Failed to launch '{}': {}", program, err))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "Child process has no stdin.".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "Child process has no stdout.".to_string())?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_task = spawn_stdout_reader(stdout, Arc::clone(&pending), self.config.id.clone());
        let stderr_task = child.stderr.take().map(|stderr| {
            let server_id = self.config.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] stderr: {}", server_id, line);
                }
            })
        });

        Ok(StdioConnection {
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            pending,
            next_request_id: Arc::new(AtomicI64::new(1)),
            child: Some(child),
            reader_task,
            stderr_task,
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, String> {
        let (id, receiver, stdin) = {
            let guard = self.inner.lock().await;
            let connection = guard
                .as_ref()
                .ok_or_else(|| format!("Server '{}' is not started.", self.config.id))?;

            let id = connection.next_request_id.fetch_add(1, Ordering::SeqCst);
            let (sender, receiver) = oneshot::channel();
            lock_pending(&connection.pending).insert(id, sender);
            (id, receiver, Arc::clone(&connection.stdin))
        };

        let frame = framing::encode_frame(
            &serde_json::to_value(JsonRpcRequest::new(id, method, params))
                .map_err(|err| err.to_string())?,
        );
        if let Err(err) = write_frame(&stdin, &frame).await {
            self.forget_pending(id).await;
            return Err(format!("Failed to send request: {}", err));
        }

        match tokio::time::timeout(self.request_timeout(), receiver).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(format!("Server '{}' closed the connection.", self.config.id)),
            Err(_) => {
                self.forget_pending(id).await;
                Err(format!(
                    "Request '{}' to '{}' timed out.",
                    method, self.config.id
                ))
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), String> {
        let stdin = {
            let guard = self.inner.lock().await;
            let connection = guard
                .as_ref()
                .ok_or_else(|| format!("Server '{}' is not started.", self.config.id))?;
            Arc::clone(&connection.stdin)
        };
        let frame = framing::encode_frame(
            &serde_json::to_value(JsonRpcRequest::notification(method, params))
                .map_err(|err| err.to_string())?,
        );
        write_frame(&stdin, &frame)
            .await
            .map_err(|err| format!("Failed to send notification: {}", err))
    }

    async fn forget_pending(&self, id: i64) {
        let guard = self.inner.lock().await;
        if let Some(connection) = guard.as_ref() {
            lock_pending(&connection.pending).remove(&id);
        }
    }
}

#[async_trait]
impl McpTransport for StdioClient {
    async fn start(&self) -> Result<(), String> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(self.spawn_connection().await?);
        Ok(())
    }

    async fn initialize(&self) -> Result<(), String> {
        self.request(METHOD_INITIALIZE, initialize_params()).await?;
        self.notify(METHOD_INITIALIZED, Value::Null).await
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, String> {
        let result = self.request(METHOD_LIST_TOOLS, Value::Null).await?;
        parse_tool_list(result)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<String, String> {
        let result = self
            .request(
                METHOD_CALL_TOOL,
                crate::mcp::protocol::call_tool_params(name, arguments),
            )
            .await?;
        let rendered = render_tool_content(&result);
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(rendered);
        }
        Ok(rendered)
    }

    async fn stop(&self) {
        let Some(connection) = self.inner.lock().await.take() else {
            return;
        };
        connection.reader_task.abort();
        if let Some(task) = connection.stderr_task {
            task.abort();
        }
        // Dropping the senders wakes any waiter with a closed-channel error.
        lock_pending(&connection.pending).clear();
        if let Some(mut child) = connection.child {
            if let Err(err) = child.start_kill() {
                debug!("[{}] kill failed: {}", self.config.id, err);
            }
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
    }
}

fn spawn_stdout_reader(
    stdout: tokio::process::ChildStdout,
    pending: PendingMap,
    server_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        loop {
            match framing::read_message(&mut reader).await {
                Ok(Some(message)) => resolve_response(&pending, message),
                Ok(None) => break,
                Err(err) => {
                    warn!("[{}] read error: {}", server_id, err);
                    break;
                }
            }
        }
        // Stream ended: fail outstanding requests instead of letting them
        // ride out their timeouts.
        lock_pending(&pending).clear();
    })
}

/// Hands a decoded frame to the waiter registered under its id, if any.
fn resolve_response(pending: &Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>, value: Value) {
    let Some(response) = parse_response(value) else {
        return;
    };
    let Some(id) = response.request_id() else {
        debug!("Discarding response with non-integer id");
        return;
    };
    let sender = pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&id);
    match sender {
        Some(sender) => {
            let _ = sender.send(response);
        }
        None => debug!("Discarding response for unknown request id {}", id),
    }
}

fn lock_pending(
    pending: &Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
) -> std::sync::MutexGuard<'_, HashMap<i64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn write_frame(
    stdin: &tokio::sync::Mutex<ChildStdin>,
    frame: &[u8],
) -> std::io::Result<()> {
    let mut guard = stdin.lock().await;
    guard.write_all(frame).await?;
    guard.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register(pending: &PendingMap, id: i64) -> oneshot::Receiver<JsonRpcResponse> {
        let (sender, receiver) = oneshot::channel();
        lock_pending(pending).insert(id, sender);
        receiver
    }

    #[tokio::test]
    async fn responses_resolve_waiters_out_of_order() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let first = register(&pending, 1);
        let second = register(&pending, 2);

        resolve_response(&pending, json!({"jsonrpc": "2.0", "id": 2, "result": "two"}));
        resolve_response(&pending, json!({"jsonrpc": "2.0", "id": 1, "result": "one"}));

        let second = second.await.expect("second waiter");
        assert_eq!(second.into_result().expect("result"), json!("two"));
        let first = first.await.expect("first waiter");
        assert_eq!(first.into_result().expect("result"), json!("one"));
        assert!(lock_pending(&pending).is_empty());
    }

    #[tokio::test]
    async fn unmatched_and_malformed_frames_are_discarded() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let receiver = register(&pending, 5);

        // No waiter under this id.
        resolve_response(&pending, json!({"jsonrpc": "2.0", "id": 9, "result": {}}));
        // Server-initiated request, not a response.
        resolve_response(
            &pending,
            json!({"jsonrpc": "2.0", "id": 5, "method": "ping"}),
        );
        // Neither result nor error.
        resolve_response(&pending, json!({"jsonrpc": "2.0", "id": 5}));

        assert_eq!(lock_pending(&pending).len(), 1);
        resolve_response(&pending, json!({"jsonrpc": "2.0", "id": 5, "result": null}));
        receiver.await.expect("waiter resolved");
    }

    #[tokio::test]
    async fn request_without_start_reports_not_started() {
        let client = StdioClient::new(McpServerConfig {
            id: "alpha".to_string(),
            display_name: "Alpha".to_string(),
            transport: Some("stdio".to_string()),
            command: Some("alpha-server".to_string()),
            args: None,
            env: None,
            base_url: None,
            headers: None,
            timeout_seconds: None,
            enabled: None,
        });
        let err = client
            .request(METHOD_LIST_TOOLS, Value::Null)
            .await
            .expect_err("not started");
        assert!(err.contains("not started"));
    }
}
