//! JSON-RPC over HTTP POST with a server-sent-event response stream.
//!
//! The session opens an event stream on the descriptor url; the first
//! `endpoint` event names the POST target for outbound frames, and every
//! subsequent `message` event carries one JSON-RPC frame from the server.

use super::{ServerNotification, ToolTransport, TransportError};
use crate::config::ServerDescriptor;
use crate::infrastructure::rpc::RpcResponse;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct SseTransport {
    inner: Arc<SseInner>,
}

struct SseInner {
    server_id: String,
    http: reqwest::Client,
    post_url: AsyncMutex<Option<reqwest::Url>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<Result<Value, TransportError>>>>,
    id_counter: AtomicU64,
    notices: mpsc::UnboundedSender<ServerNotification>,
    pump: AsyncMutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its POST
    /// endpoint. Callers bound the overall wait with their connect timeout.
    pub async fn connect(
        descriptor: &ServerDescriptor,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerNotification>), TransportError> {
        let url = descriptor
            .url
            .as_deref()
            .ok_or_else(|| TransportError::NotConfigured {
                server: descriptor.id.clone(),
            })?;
        let base = reqwest::Url::parse(url).map_err(|err| TransportError::Handshake {
            server: descriptor.id.clone(),
            message: format!("invalid endpoint url '{url}': {err}"),
        })?;

        let (notices, notice_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SseInner {
            server_id: descriptor.id.clone(),
            http: reqwest::Client::new(),
            post_url: AsyncMutex::new(None),
            pending: AsyncMutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            notices,
            pump: AsyncMutex::new(None),
        });

        let mut stream = EventSource::get(base.clone());

        // The endpoint announcement must arrive before any request can go out.
        loop {
            match stream.next().await {
                Some(Ok(Event::Open)) => continue,
                Some(Ok(Event::Message(message))) if message.event == "endpoint" => {
                    let endpoint =
                        base.join(message.data.trim())
                            .map_err(|err| TransportError::Handshake {
                                server: descriptor.id.clone(),
                                message: format!("invalid endpoint announcement: {err}"),
                            })?;
                    let mut post_url = inner.post_url.lock().await;
                    *post_url = Some(endpoint);
                    break;
                }
                Some(Ok(Event::Message(message))) => {
                    debug!(
                        server = %descriptor.id,
                        event = %message.event,
                        "ignoring pre-endpoint event"
                    );
                }
                Some(Err(err)) => {
                    return Err(TransportError::Handshake {
                        server: descriptor.id.clone(),
                        message: format!("event stream failed before endpoint: {err}"),
                    });
                }
                None => {
                    return Err(TransportError::Handshake {
                        server: descriptor.id.clone(),
                        message: "event stream closed before endpoint announcement".to_string(),
                    });
                }
            }
        }

        let pump_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            pump_inner.pump_events(stream).await;
        });
        {
            let mut pump = inner.pump.lock().await;
            *pump = Some(handle);
        }

        Ok((Self { inner }, notice_rx))
    }
}

#[async_trait]
impl ToolTransport for SseTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.inner.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id.clone(), tx);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.inner.post(&payload).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Terminated {
                server: self.inner.server_id.clone(),
            }),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.inner.post(&payload).await
    }

    async fn close(&self) {
        self.inner.shutdown().await;
    }
}

impl SseInner {
    async fn pump_events(self: Arc<Self>, mut stream: EventSource) {
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => {
                    match serde_json::from_str::<Value>(&message.data) {
                        Ok(value) => self.route_inbound(value).await,
                        Err(source) => {
                            warn!(
                                server = %self.server_id,
                                %source,
                                "received invalid JSON over event stream"
                            );
                        }
                    }
                }
                Err(err) => {
                    warn!(server = %self.server_id, %err, "event stream failed");
                    break;
                }
            }
        }
        stream.close();
        self.fail_pending().await;
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
            let _ = self.notices.send(ServerNotification { method, params });
        }
    }

    async fn handle_response(&self, id: Value, value: Value) {
        let key = match &id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return,
        };

        let responder = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };
        let Some(sender) = responder else {
            debug!(server = %self.server_id, response_id = %key, "response for unknown request");
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
            other => RpcResponse::method_not_found(Some(id), other),
        };
        match serde_json::to_value(&response) {
            Ok(payload) => {
                if let Err(err) = self.post(&payload).await {
                    warn!(server = %self.server_id, %err, "failed to answer server request");
                }
            }
            Err(source) => {
                warn!(server = %self.server_id, %source, "failed to encode response");
            }
        }
    }

    async fn post(&self, payload: &Value) -> Result<(), TransportError> {
        let url = {
            let post_url = self.post_url.lock().await;
            post_url.clone().ok_or_else(|| TransportError::Terminated {
                server: self.server_id.clone(),
            })?
        };

        let response = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|err| TransportError::Transport {
                server: self.server_id.clone(),
                message: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Transport {
                server: self.server_id.clone(),
                message: format!("endpoint returned HTTP {}", response.status()),
            });
        }
        Ok(())
    }

    async fn shutdown(&self) {
        {
            let mut pump = self.pump.lock().await;
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        {
            let mut post_url = self.post_url.lock().await;
            *post_url = None;
        }
        self.fail_pending().await;
    }

    async fn fail_pending(&self) {
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
