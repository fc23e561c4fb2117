//! Line-delimited JSON-RPC over a child process's stdio.

use super::{ServerNotification, ToolTransport, TransportError};
use crate::config::ServerDescriptor;
use crate::infrastructure::rpc::RpcResponse;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tracing::{debug, warn};

pub struct StdioTransport {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    server_id: String,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<Result<Value, TransportError>>>>,
    id_counter: AtomicU64,
    notices: mpsc::UnboundedSender<ServerNotification>,
}

impl StdioTransport {
    /// Spawn the server process and start the reader loop. Returns the
    /// transport and the receiver for server-pushed notifications.
    pub async fn spawn(
        descriptor: &ServerDescriptor,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerNotification>), TransportError> {
        let mut command = Command::new(&descriptor.command);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if !descriptor.args.is_empty() {
            command.args(&descriptor.args);
        }
        for (key, value) in &descriptor.env {
            command.env(key, value);
        }
        if let Some(dir) = &descriptor.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            server: descriptor.id.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| TransportError::Transport {
            server: descriptor.id.clone(),
            message: "failed to capture server stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Transport {
            server: descriptor.id.clone(),
            message: "failed to capture server stdout".to_string(),
        })?;

        let (notices, notice_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(StdioInner {
            server_id: descriptor.id.clone(),
            child: AsyncMutex::new(Some(child)),
            writer: AsyncMutex::new(Some(BufWriter::new(stdin))),
            pending: AsyncMutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            notices,
        });

        let reader = Arc::clone(&inner);
        tokio::spawn(async move {
            reader.reader_loop(stdout).await;
        });

        Ok((Self { inner }, notice_rx))
    }
}

#[async_trait]
impl ToolTransport for StdioTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        self.inner.request(method, params).await
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.inner.write_message(&payload).await
    }

    async fn close(&self) {
        self.inner.reset().await;
    }
}

impl StdioInner {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), tx);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Terminated {
                server: self.server_id.clone(),
            }),
        }
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(item) = lines.next_line().await {
            match item {
                Some(raw) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if trimmed.starts_with('\u{1b}') {
                        debug!(
                            server = %self.server_id,
                            "skipping non-JSON ANSI log line from tool server"
                        );
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(value) => self.route_inbound(value).await,
                        Err(source) => {
                            warn!(
                                server = %self.server_id,
                                line = trimmed,
                                %source,
                                "received invalid JSON from tool server"
                            );
                        }
                    }
                }
                None => break,
            }
        }

        self.reset().await;
    }

    async fn route_inbound(&self, value: Value) {
        if let Some(id) = value.get("id").cloned() {
            if value.get("method").is_some() {
                self.handle_server_request(id, value).await;
            } else {
                self.handle_response(id, value).await;
            }
        } else if value.get("method").is_some() {
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            debug!(server = %self.server_id, method = %method, "server notification");
            let _ = self.notices.send(ServerNotification { method, params });
        }
    }

    async fn handle_response(&self, id: Value, value: Value) {
        let key = match response_key(&id) {
            Some(key) => key,
            None => return,
        };

        let responder = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };

        let Some(sender) = responder else {
            debug!(
                server = %self.server_id,
                response_id = %key,
                "received response for unknown request"
            );
            return;
        };

        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let _ = sender.send(Err(TransportError::Rpc {
                server: self.server_id.clone(),
                code,
                message,
            }));
        } else {
            let result = value.get("result").cloned().unwrap_or(Value::Null);
            let _ = sender.send(Ok(result));
        }
    }

    async fn handle_server_request(&self, id: Value, value: Value) {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let response = match method {
            "ping" => RpcResponse::success(Some(id), json!({})),
            other => {
                warn!(
                    server = %self.server_id,
                    method = other,
                    "server sent unsupported request"
                );
                RpcResponse::method_not_found(Some(id), other)
            }
        };
        match serde_json::to_value(&response) {
            Ok(payload) => {
                if let Err(err) = self.write_message(&payload).await {
                    warn!(server = %self.server_id, %err, "failed to answer server request");
                }
            }
            Err(source) => {
                warn!(server = %self.server_id, %source, "failed to encode response");
            }
        }
    }

    async fn write_message(&self, message: &Value) -> Result<(), TransportError> {
        let encoded =
            serde_json::to_string(message).map_err(|source| TransportError::InvalidJson {
                server: self.server_id.clone(),
                source,
            })?;

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| TransportError::Terminated {
            server: self.server_id.clone(),
        })?;
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(|source| TransportError::Transport {
                server: self.server_id.clone(),
                message: source.to_string(),
            })?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|source| TransportError::Transport {
                server: self.server_id.clone(),
                message: source.to_string(),
            })?;
        stream
            .flush()
            .await
            .map_err(|source| TransportError::Transport {
                server: self.server_id.clone(),
                message: source.to_string(),
            })?;
        Ok(())
    }

    async fn reset(&self) {
        {
            let mut writer = self.writer.lock().await;
            *writer = None;
        }

        let mut child = self.child.lock().await;
        if let Some(mut running) = child.take() {
            if let Err(err) = running.kill().await {
                debug!(
                    server = %self.server_id,
                    %err,
                    "failed to kill tool server process (may have already exited)"
                );
            }
            let _ = running.wait().await;
        }
        drop(child);

        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(TransportError::Terminated {
                server: self.server_id.clone(),
            }));
        }
    }

    fn next_id(&self) -> String {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("req-{id}")
    }
}

fn response_key(id: &Value) -> Option<String> {
    match id {
        Value::String(value) => Some(value.clone()),
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}
