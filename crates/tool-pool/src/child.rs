//! One supervised tool subprocess: spawn, initialize handshake, and a
//! pending-request map resolving JSON-RPC responses to their callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::timeout;

use crate::error::{Result, ToolPoolError};
use crate::protocol::{IncomingMessage, JsonRpcRequest, ToolDescriptor, ToolsListResult};

const PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "agentflow-orchestrator";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Launch parameters for one tool server.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

type PendingMap = DashMap<u64, oneshot::Sender<std::result::Result<Value, (i64, String)>>>;

/// A running (or exited) tool subprocess. Responses are matched to
/// callers by id via `pending`; a reader task owns the child's stdout
/// for the lifetime of the process.
pub struct ToolChild {
    pub name: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    next_id: AtomicU64,
    pending: Arc<PendingMap>,
    tools_cache: RwLock<Option<Vec<ToolDescriptor>>>,
    exited: Arc<tokio::sync::Notify>,
    alive: Arc<std::sync::atomic::AtomicBool>,
}

impl ToolChild {
    pub async fn spawn(spec: &ServerSpec, handshake_timeout: Duration) -> Result<Self> {
        let mut command = tokio::process::Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = command.spawn().map_err(|e| ToolPoolError::SpawnFailed {
            server: spec.name.clone(),
            message: e.to_string(),
        })?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let exited = Arc::new(tokio::sync::Notify::new());
        let alive = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (init_tx, init_rx) = oneshot::channel();

        spawn_stdout_reader(spec.name.clone(), stdout, pending.clone(), exited.clone(), alive.clone(), init_tx);
        spawn_stderr_drain(spec.name.clone(), stderr);

        let session = Self {
            name: spec.name.clone(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            next_id: AtomicU64::new(1),
            pending,
            tools_cache: RwLock::new(None),
            exited,
            alive,
        };

        session.send_initialize().await?;

        match timeout(handshake_timeout, init_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(ToolPoolError::ToolChildExit { server: spec.name.clone() });
            }
            Err(_) => {
                return Err(ToolPoolError::HandshakeTimeout {
                    server: spec.name.clone(),
                    timeout: handshake_timeout,
                });
            }
        }

        Ok(session)
    }

    async fn send_initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION") },
        });
        self.write_request("initialize", params).await?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ToolPoolError::Io { server: self.name.clone(), source: e })?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| ToolPoolError::Io { server: self.name.clone(), source: e })?;
        stdin
            .flush()
            .await
            .map_err(|e| ToolPoolError::Io { server: self.name.clone(), source: e })
    }

    async fn write_request(&self, method: &str, params: Value) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&request)
            .map_err(|e| ToolPoolError::Protocol { server: self.name.clone(), message: e.to_string() })?;
        self.write_line(&line).await?;
        Ok(id)
    }

    /// Sends a request and awaits its matching response, or rejects on
    /// timeout / child exit.
    pub async fn call(&self, method: &str, params: Value, call_timeout: Duration) -> Result<Value> {
        if !self.is_alive() {
            return Err(ToolPoolError::ToolChildExit { server: self.name.clone() });
        }

        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&request)
            .map_err(|e| ToolPoolError::Protocol { server: self.name.clone(), message: e.to_string() })?;

        if let Err(e) = self.write_line(&line).await {
            self.pending.remove(&id);
            return Err(e);
        }

        tokio::select! {
            result = rx => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err((code, message))) => Err(ToolPoolError::Rpc { server: self.name.clone(), code, message }),
                Err(_) => Err(ToolPoolError::ToolChildExit { server: self.name.clone() }),
            },
            _ = tokio::time::sleep(call_timeout) => {
                self.pending.remove(&id);
                Err(ToolPoolError::ToolTimeout(call_timeout))
            }
            _ = self.exited.notified() => {
                self.pending.remove(&id);
                Err(ToolPoolError::ToolChildExit { server: self.name.clone() })
            }
        }
    }

    /// The child's `tools/list`, cached for the lifetime of the process.
    pub async fn tools(&self, call_timeout: Duration) -> Result<Vec<ToolDescriptor>> {
        if let Some(cached) = self.tools_cache.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let raw = self.call("tools/list", json!({}), call_timeout).await?;
        let parsed: ToolsListResult = serde_json::from_value(raw)
            .map_err(|e| ToolPoolError::Protocol { server: self.name.clone(), message: e.to_string() })?;
        *self.tools_cache.write().await = Some(parsed.tools.clone());
        Ok(parsed.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value, meta: Value, call_timeout: Duration) -> Result<Value> {
        self.call(
            "tools/call",
            json!({ "name": name, "arguments": arguments, "_meta": meta }),
            call_timeout,
        )
        .await
    }

    /// Graceful shutdown: close stdin and give the child a grace period
    /// to exit on its own before force-killing it. Idempotent.
    pub async fn shutdown(&self) {
        if !self.is_alive() {
            return;
        }
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }

        let mut child = self.child.lock().await;
        if timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

fn spawn_stdout_reader(
    server: String,
    stdout: tokio::process::ChildStdout,
    pending: Arc<PendingMap>,
    exited: Arc<tokio::sync::Notify>,
    alive: Arc<std::sync::atomic::AtomicBool>,
    init_tx: oneshot::Sender<()>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        let mut init_tx = Some(init_tx);

        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<IncomingMessage>(&line) {
                        Ok(IncomingMessage::Response { id, result, error }) => {
                            if let Some((_, tx)) = pending.remove(&id) {
                                let outcome = match error {
                                    Some(e) => Err((e.code, e.message)),
                                    None => Ok(result.unwrap_or(Value::Null)),
                                };
                                let _ = tx.send(outcome);
                            }
                        }
                        Ok(IncomingMessage::Notification { method, .. }) => {
                            if method == "notifications/initialized" {
                                if let Some(tx) = init_tx.take() {
                                    let _ = tx.send(());
                                }
                            }
                        }
                        Ok(IncomingMessage::ServerRequest { .. }) => {
                            // Requests originating from the server (e.g. `roots/list`)
                            // are left unanswered; the pool only drives
                            // initialize/tools/list/tools/call.
                        }
                        Err(e) => {
                            tracing::warn!(server = %server, error = %e, "malformed line from tool child");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "error reading from tool child");
                    break;
                }
            }
        }

        alive.store(false, Ordering::SeqCst);
        pending.clear();
        exited.notify_waiters();
    });
}

fn spawn_stderr_drain(server: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            tracing::debug!(server = %server, "{line}");
        }
    });
}
