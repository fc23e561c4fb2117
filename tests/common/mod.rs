#![allow(dead_code)]

//! Shared harness: simulated tool servers with scripted delays and failures.

use async_trait::async_trait;
use orrery::config::{DescriptorSource, RawDescriptor, ServerDescriptor, StaticDescriptorSource, TransportKind};
use orrery::infrastructure::transport::{
    Connector, ServerNotification, ToolTransport, TransportError, TransportHandle,
};
use orrery::{ExecutionGateway, GatewayConfig, ToolRegistry};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted behavior for one simulated tool server.
pub struct SimulatedServer {
    pub connect_delay: Mutex<Duration>,
    connect_failures: AtomicUsize,
    ping_ok: AtomicBool,
    ping_delay: Mutex<Duration>,
    call_ok: AtomicBool,
    call_delay: Mutex<Duration>,
    tools: Mutex<Vec<Value>>,
    request_count: AtomicUsize,
    notice_tx: Mutex<Option<mpsc::UnboundedSender<ServerNotification>>>,
}

impl SimulatedServer {
    pub fn new(tools: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            connect_delay: Mutex::new(Duration::ZERO),
            connect_failures: AtomicUsize::new(0),
            ping_ok: AtomicBool::new(true),
            ping_delay: Mutex::new(Duration::ZERO),
            call_ok: AtomicBool::new(true),
            call_delay: Mutex::new(Duration::ZERO),
            tools: Mutex::new(tools),
            request_count: AtomicUsize::new(0),
            notice_tx: Mutex::new(None),
        })
    }

    pub fn tool(name: &str, requires_confirmation: bool) -> Value {
        json!({
            "name": name,
            "description": format!("simulated tool {name}"),
            "requiresConfirmation": requires_confirmation,
            "inputSchema": {"type": "object"},
        })
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().expect("connect delay lock") = delay;
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock().expect("ping delay lock") = delay;
    }

    pub fn set_call_ok(&self, ok: bool) {
        self.call_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().expect("call delay lock") = delay;
    }

    /// Wire round trips seen so far (requests only, not notifications).
    pub fn requests(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Push a `tools/list_changed` notification to the connected client.
    pub fn push_list_changed(&self) {
        if let Some(tx) = self.notice_tx.lock().expect("notice lock").as_ref() {
            let _ = tx.send(ServerNotification {
                method: "notifications/tools/list_changed".to_string(),
                params: Value::Null,
            });
        }
    }

    pub fn set_tools(&self, tools: Vec<Value>) {
        *self.tools.lock().expect("tools lock") = tools;
    }

    fn take_connect_failure(&self) -> bool {
        self.connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 { Some(n - 1) } else { None }
            })
            .is_ok()
    }
}

pub struct SimulatedTransport {
    server: Arc<SimulatedServer>,
    server_id: String,
}

#[async_trait]
impl ToolTransport for SimulatedTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        self.server.request_count.fetch_add(1, Ordering::SeqCst);
        match method {
            "initialize" => Ok(json!({
                "serverInfo": {"name": self.server_id, "version": "1.0.0"},
                "capabilities": {"tools": {"listChanged": true}},
            })),
            "tools/list" => Ok(json!({
                "tools": self.server.tools.lock().expect("tools lock").clone(),
            })),
            "ping" => {
                let delay = *self.server.ping_delay.lock().expect("ping delay lock");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if self.server.ping_ok.load(Ordering::SeqCst) {
                    Ok(json!({}))
                } else {
                    Err(TransportError::Transport {
                        server: self.server_id.clone(),
                        message: "simulated ping failure".to_string(),
                    })
                }
            }
            "tools/call" => {
                let delay = *self.server.call_delay.lock().expect("call delay lock");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if self.server.call_ok.load(Ordering::SeqCst) {
                    Ok(json!({
                        "content": [{"type": "text", "text": "ok"}],
                        "echo": params,
                    }))
                } else {
                    Err(TransportError::Terminated {
                        server: self.server_id.clone(),
                    })
                }
            }
            other => Err(TransportError::Rpc {
                server: self.server_id.clone(),
                code: -32601,
                message: format!("method '{other}' not supported"),
            }),
        }
    }

    async fn notify(&self, _method: &str, _params: Value) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {}
}

/// Connector serving simulated transports by server id.
#[derive(Default)]
pub struct SimulatedConnector {
    servers: Mutex<HashMap<String, Arc<SimulatedServer>>>,
}

impl SimulatedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: &str, server: Arc<SimulatedServer>) {
        self.servers
            .lock()
            .expect("server map lock")
            .insert(id.to_string(), server);
    }

    pub fn server(&self, id: &str) -> Arc<SimulatedServer> {
        self.servers
            .lock()
            .expect("server map lock")
            .get(id)
            .cloned()
            .expect("unknown simulated server")
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<TransportHandle, TransportError> {
        let server = self
            .servers
            .lock()
            .expect("server map lock")
            .get(&descriptor.id)
            .cloned()
            .ok_or_else(|| TransportError::NotConfigured {
                server: descriptor.id.clone(),
            })?;

        let delay = *server.connect_delay.lock().expect("connect delay lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if server.take_connect_failure() {
            return Err(TransportError::Transport {
                server: descriptor.id.clone(),
                message: "simulated connect failure".to_string(),
            });
        }

        let (tx, notifications) = mpsc::unbounded_channel();
        *server.notice_tx.lock().expect("notice lock") = Some(tx);
        Ok(TransportHandle {
            transport: Arc::new(SimulatedTransport {
                server,
                server_id: descriptor.id.clone(),
            }),
            notifications,
        })
    }
}

pub fn descriptor(id: &str, categories: &[&str]) -> ServerDescriptor {
    ServerDescriptor::from_raw(
        id,
        RawDescriptor {
            command: Some(format!("/opt/sim/{id}")),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            transport: TransportKind::Stdio,
            url: None,
            category_hints: categories.iter().map(|c| c.to_string()).collect(),
        },
    )
    .expect("valid simulated descriptor")
}

pub struct Harness {
    pub gateway: ExecutionGateway,
    pub connector: Arc<SimulatedConnector>,
    pub registry: Arc<ToolRegistry>,
}

pub fn harness(
    descriptors: Vec<ServerDescriptor>,
    connector: Arc<SimulatedConnector>,
    config: GatewayConfig,
) -> Harness {
    let source: Arc<dyn DescriptorSource> = Arc::new(StaticDescriptorSource::new(descriptors));
    let registry = Arc::new(ToolRegistry::new());
    let gateway = ExecutionGateway::new(
        source,
        Arc::clone(&registry),
        Arc::clone(&connector) as Arc<dyn Connector>,
        config,
    );
    Harness {
        gateway,
        connector,
        registry,
    }
}

/// A fast backoff policy for paused-clock tests.
pub fn fast_config() -> GatewayConfig {
    GatewayConfig {
        connect_timeout: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(100),
        health_interval: Duration::from_secs(1),
        call_timeout: Duration::from_secs(5),
        backoff: orrery::BackoffPolicy {
            base: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
            max_attempts: 3,
        },
    }
}
