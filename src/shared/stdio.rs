//! Local-process transport.
//!
//! Spawns the backend as a child process and exchanges newline-delimited
//! JSON-RPC messages over its stdin/stdout. Stderr is captured and can be
//! taken once for diagnostics.

use crate::error::{Result, TransportError};
use crate::shared::context::RequestContext;
use crate::shared::pending::PendingRequests;
use crate::shared::transport::Transport;
use crate::types::{IncomingMessage, JSONRPCNotification, JSONRPCRequest, JSONRPCResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// How long `close` waits for the killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport over a spawned subprocess's standard streams.
#[derive(Debug)]
pub struct ProcessTransport {
    command: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    stderr: parking_lot::Mutex<Option<ChildStderr>>,
    pending: Arc<PendingRequests>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ProcessTransport {
    /// Spawn `command` with `args`.
    ///
    /// `env` is added on top of the inherited environment; entries in `env`
    /// win over inherited variables with the same key.
    pub fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TransportError::from)?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::InvalidMessage("child stdout unavailable".into()))?;

        tracing::debug!(command, ?pid, env_vars = env.len(), "spawned backend process");

        let pending = Arc::new(PendingRequests::new());
        let reader = tokio::spawn(read_stdout(command.to_string(), stdout, pending.clone()));

        Ok(Self {
            command: command.to_string(),
            pid,
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            stderr: parking_lot::Mutex::new(stderr),
            pending,
            reader: parking_lot::Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        })
    }

    /// OS process id of the child, if it was still running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the child's stderr stream. Returns `None` after the first call.
    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.stderr.lock().take()
    }

    /// Serialize a message as one newline-terminated line.
    fn encode_line<T: serde::Serialize>(message: &T) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(message).map_err(|e| {
            TransportError::InvalidMessage(format!("Failed to serialize message: {}", e))
        })?;
        line.push(b'\n');
        Ok(line)
    }

    async fn write_line(&self, line: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(TransportError::ConnectionClosed)?;
        stdin.write_all(line).await.map_err(TransportError::from)?;
        stdin.flush().await.map_err(TransportError::from)?;
        Ok(())
    }
}

async fn read_stdout(command: String, stdout: ChildStdout, pending: Arc<PendingRequests>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match IncomingMessage::parse(line.as_bytes()) {
                    Ok(IncomingMessage::Response(response)) => {
                        let id = response.id.clone();
                        if !pending.complete(response) {
                            tracing::debug!(command = %command, ?id, "dropping unmatched response");
                        }
                    },
                    Ok(IncomingMessage::Request(request)) => {
                        tracing::debug!(command = %command, method = %request.method, "ignoring server request");
                    },
                    Ok(IncomingMessage::Notification(notification)) => {
                        tracing::trace!(command = %command, method = %notification.method, "server notification");
                    },
                    Err(_) => {
                        tracing::debug!(command = %command, "skipping non-protocol output line");
                    },
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(command = %command, error = %e, "failed reading backend stdout");
                break;
            },
        }
    }
    tracing::debug!(command = %command, "backend stdout closed");
    pending.fail_all();
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn request(
        &self,
        request: JSONRPCRequest,
        ctx: &RequestContext,
    ) -> Result<JSONRPCResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed.into());
        }

        let id = request.id.clone();
        let line = Self::encode_line(&request)?;
        let rx = self.pending.register(id.clone())?;

        if let Err(e) = ctx.run(self.write_line(&line)).await {
            self.pending.cancel(&id);
            return Err(e);
        }

        self.pending.wait(&id, rx, ctx).await
    }

    async fn notify(
        &self,
        notification: JSONRPCNotification,
        ctx: &RequestContext,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed.into());
        }
        let line = Self::encode_line(&notification)?;
        ctx.run(self.write_line(&line)).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Dropping stdin delivers EOF to well-behaved servers.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(command = %self.command, error = %e, "kill failed; process may have exited");
            }
            match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(command = %self.command, %status, "backend process exited");
                },
                Ok(Err(e)) => {
                    tracing::warn!(command = %self.command, error = %e, "failed to reap backend process");
                },
                Err(_) => {
                    tracing::warn!(command = %self.command, pid = ?self.pid, "backend process did not exit in time");
                },
            }
        }

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.fail_all();
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "stdio"
    }
}
