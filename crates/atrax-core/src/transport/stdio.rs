//! Stdio transport: a child process speaking newline-delimited JSON-RPC on
//! its stdin/stdout, with stderr captured strictly as diagnostic output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::error::{AtraxError, Result};
use crate::transport::{EventStream, MessageStream, Transport, TransportEvent, DEFAULT_SEND_BUFFER_LIMIT};

/// Grace period `close()` waits for the child to exit after SIGTERM before
/// it is assumed to need a harder kill.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub struct StdioTransport {
    session_name: String,
    pub(crate) command: String,
    pub(crate) args: Vec<String>,
    env: HashMap<String, String>,
    send_buffer_limit: usize,

    child: Mutex<Option<Child>>,
    stdin_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    state_tx: mpsc::UnboundedSender<TransportEvent>,
    state_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    pending_bytes: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl StdioTransport {
    pub fn new(session_name: impl Into<String>, command: impl Into<String>, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self::with_send_buffer_limit(session_name, command, args, env, DEFAULT_SEND_BUFFER_LIMIT)
    }

    pub fn with_send_buffer_limit(
        session_name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        send_buffer_limit: usize,
    ) -> Self {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        Self {
            session_name: session_name.into(),
            command: command.into(),
            args,
            env,
            send_buffer_limit,
            child: Mutex::new(None),
            stdin_tx: Mutex::new(None),
            inbound_rx: Mutex::new(None),
            state_tx,
            state_rx: Mutex::new(Some(state_rx)),
            pending_bytes: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn open(&self) -> Result<()> {
        let mut cmd = self.build_command();
        let mut child = cmd
            .spawn()
            .map_err(|e| AtraxError::TransportUnavailable(format!("spawning '{}': {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AtraxError::TransportUnavailable("child has no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AtraxError::TransportUnavailable("child has no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AtraxError::TransportUnavailable("child has no stderr pipe".to_string()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Value>();

        let pending_bytes = self.pending_bytes.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                pending_bytes.fetch_sub(line.len().min(pending_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let session_name = self.session_name.clone();
        let state_tx = self.state_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(value) => {
                                if inbound_tx.send(value).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(session = %session_name, "dropping malformed line from upstream stdout: {e}");
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = state_tx.send(TransportEvent::Closed("stdout closed".to_string()));
                        break;
                    }
                    Err(e) => {
                        let _ = state_tx.send(TransportEvent::Error(format!("stdout read error: {e}")));
                        break;
                    }
                }
            }
        });

        let session_name = self.session_name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(session = %session_name, "{line}");
            }
        });

        *self.child.lock() = Some(child);
        *self.stdin_tx.lock() = Some(stdin_tx);
        *self.inbound_rx.lock() = Some(inbound_rx);
        let _ = self.state_tx.send(TransportEvent::Opened);

        Ok(())
    }

    async fn send(&self, message: Value) -> Result<()> {
        let line = serde_json::to_string(&message)
            .map_err(|e| AtraxError::WriteFailed(format!("serializing message: {e}")))?;

        let current = self.pending_bytes.load(Ordering::Relaxed);
        if current + line.len() > self.send_buffer_limit {
            return Err(AtraxError::WriteBackpressure {
                limit: self.send_buffer_limit,
            });
        }

        let tx = self.stdin_tx.lock().clone();
        let tx = tx.ok_or(AtraxError::TransportClosed)?;
        self.pending_bytes.fetch_add(line.len(), Ordering::Relaxed);
        tx.send(line)
            .map_err(|_| AtraxError::WriteFailed("stdin writer task is gone".to_string()))
    }

    fn receive_stream(&self) -> MessageStream {
        match self.inbound_rx.lock().take() {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => Box::pin(futures::stream::empty()),
        }
    }

    fn state_stream(&self) -> EventStream {
        match self.state_rx.lock().take() {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => Box::pin(futures::stream::empty()),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        *self.stdin_tx.lock() = None;

        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return Ok(());
        };

        if let Some(pid) = child.id() {
            terminate(pid);
        }

        match tokio::time::timeout(CLOSE_GRACE_PERIOD, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        let _ = self.state_tx.send(TransportEvent::Closed("closed by proxy".to_string()));
        Ok(())
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {
    // start_kill() is issued from close() itself on non-unix targets.
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(child) = self.child.lock().as_mut() {
            if let Some(pid) = child.id() {
                terminate(pid);
            } else {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_fails_for_nonexistent_binary() {
        let transport = StdioTransport::new(
            "missing",
            "atrax-nonexistent-binary-xyz",
            vec![],
            HashMap::new(),
        );
        let result = transport.open().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn echoes_a_line_through_cat() {
        let transport = StdioTransport::new("cat-session", "cat", vec![], HashMap::new());
        transport.open().await.expect("cat should spawn");

        let mut stream = transport.receive_stream();
        transport
            .send(serde_json::json!({"jsonrpc":"2.0","id":1,"method":"ping"}))
            .await
            .expect("send should succeed");

        let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("should receive within timeout")
            .expect("stream should yield a value");
        assert_eq!(msg["method"], "ping");

        transport.close().await.expect("close should succeed");
    }

    #[tokio::test]
    async fn send_rejects_once_over_backpressure_limit() {
        let transport = StdioTransport::with_send_buffer_limit("cat-session", "cat", vec![], HashMap::new(), 8);
        transport.open().await.expect("cat should spawn");

        let big = serde_json::json!({"jsonrpc":"2.0","method":"x","params":{"pad":"0123456789"}});
        let result = transport.send(big).await;
        assert!(matches!(result, Err(AtraxError::WriteBackpressure { .. })));

        transport.close().await.expect("close should succeed");
    }
}
