//! Per-server connection: state machine, transport ownership, protocol calls.

use crate::application::events::EventBus;
use crate::application::registry::ToolRegistry;
use crate::config::ServerDescriptor;
use crate::domain::types::{
    ConnectionState, GatewayEvent, HealthCheckResult, HealthMetadata, ServerHealthSnapshot,
    ToolDescriptor,
};
use crate::infrastructure::transport::{
    Connector, PROTOCOL_VERSION, ServerNotification, ToolTransport, TransportError,
};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Probe latency samples retained per connection.
const HEALTH_HISTORY_LIMIT: usize = 20;

/// A transition request that the state table rejects. Logged at the call
/// site; never surfaced through the invocation path.
#[derive(Debug, thiserror::Error)]
#[error("invalid connection state transition for '{server}': {from:?} -> {to:?}")]
pub struct StateError {
    pub server: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Server identity captured from the initialize response.
#[derive(Debug, Clone, Default)]
pub struct HandshakeInfo {
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub capabilities: Option<Value>,
    pub instructions: Option<String>,
}

/// One managed tool-server connection.
///
/// Owns the transport channel and the connection's lifecycle bookkeeping.
/// All lifecycle work for a connection (connect, probe, recovery) runs as
/// independent tasks; no lock here is shared with another server.
pub struct ServerConnection {
    descriptor: ServerDescriptor,
    state: Mutex<ConnectionState>,
    transport: Mutex<Option<Arc<dyn ToolTransport>>>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<ServerNotification>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    handshake: Mutex<Option<HandshakeInfo>>,
    consecutive_failures: AtomicU32,
    recovery_attempts: AtomicU32,
    recovery_active: AtomicBool,
    created_at: DateTime<Utc>,
    last_success_at: Mutex<Option<DateTime<Utc>>>,
    last_check: Mutex<Option<HealthCheckResult>>,
    history: Mutex<VecDeque<HealthCheckResult>>,
    probe_gate: AsyncMutex<()>,
}

impl ServerConnection {
    pub fn new(descriptor: ServerDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            state: Mutex::new(ConnectionState::Disconnected),
            transport: Mutex::new(None),
            notifications: Mutex::new(None),
            watcher: Mutex::new(None),
            handshake: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            recovery_attempts: AtomicU32::new(0),
            recovery_active: AtomicBool::new(false),
            created_at: Utc::now(),
            last_success_at: Mutex::new(None),
            last_check: Mutex::new(None),
            history: Mutex::new(VecDeque::with_capacity(HEALTH_HISTORY_LIMIT)),
            probe_gate: AsyncMutex::new(()),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock")
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts.load(Ordering::SeqCst)
    }

    pub fn increment_recovery_attempts(&self) -> u32 {
        self.recovery_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Claim the single recovery slot for this connection. Returns false if a
    /// recovery task is already in flight.
    pub fn begin_recovery(&self) -> bool {
        !self.recovery_active.swap(true, Ordering::SeqCst)
    }

    pub fn end_recovery(&self) {
        self.recovery_active.store(false, Ordering::SeqCst);
    }

    /// Apply a transition from the state table, rejecting and logging
    /// anything the table does not allow.
    pub fn try_transition(&self, next: ConnectionState) -> Result<(), StateError> {
        let mut state = self.state.lock().expect("state lock");
        if state.can_transition_to(next) {
            debug!(
                server = %self.descriptor.id,
                from = state.as_str(),
                to = next.as_str(),
                "connection state transition"
            );
            *state = next;
            Ok(())
        } else {
            let err = StateError {
                server: self.descriptor.id.clone(),
                from: *state,
                to: next,
            };
            warn!(
                server = %self.descriptor.id,
                from = err.from.as_str(),
                to = next.as_str(),
                "rejected invalid state transition"
            );
            Err(err)
        }
    }

    /// Explicit-removal path: valid from every state.
    pub fn force_disconnect(&self) -> ConnectionState {
        let mut state = self.state.lock().expect("state lock");
        let previous = *state;
        *state = ConnectionState::Disconnected;
        if previous != ConnectionState::Disconnected {
            info!(
                server = %self.descriptor.id,
                from = previous.as_str(),
                "connection disconnected"
            );
        }
        previous
    }

    /// First connect: DISCONNECTED -> CONNECTING -> CONNECTED | ERROR.
    pub async fn establish(
        &self,
        connector: &dyn Connector,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.try_transition(ConnectionState::Connecting)
            .map_err(|err| TransportError::Transport {
                server: self.descriptor.id.clone(),
                message: err.to_string(),
            })?;

        match self.open_transport(connector, timeout).await {
            Ok(()) => {
                let _ = self.try_transition(ConnectionState::Connected);
                self.mark_success();
                info!(server = %self.descriptor.id, "tool server connected");
                Ok(())
            }
            Err(err) => {
                self.record_failure();
                let _ = self.try_transition(ConnectionState::Error);
                Err(err)
            }
        }
    }

    /// Recovery reconnect: RECOVERING -> CONNECTED | ERROR. The caller has
    /// already transitioned the connection into RECOVERING.
    pub async fn reopen(
        &self,
        connector: &dyn Connector,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        match self.open_transport(connector, timeout).await {
            Ok(()) => {
                let _ = self.try_transition(ConnectionState::Connected);
                self.reset_counters();
                self.mark_success();
                Ok(())
            }
            Err(err) => {
                self.record_failure();
                let _ = self.try_transition(ConnectionState::Error);
                Err(err)
            }
        }
    }

    async fn open_transport(
        &self,
        connector: &dyn Connector,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let timeout_ms = timeout.as_millis() as u64;
        let (handle, info) = tokio::time::timeout(timeout, async {
            let handle = connector.connect(&self.descriptor).await?;
            let transport = Arc::clone(&handle.transport);
            match self.handshake_with(transport.as_ref()).await {
                Ok(info) => Ok((handle, info)),
                Err(err) => {
                    transport.close().await;
                    Err(err)
                }
            }
        })
        .await
        .map_err(|_| TransportError::Timeout {
            server: self.descriptor.id.clone(),
            timeout_ms,
        })??;

        let stale = self
            .transport
            .lock()
            .expect("transport lock")
            .replace(Arc::clone(&handle.transport));
        if let Some(stale) = stale {
            stale.close().await;
        }
        *self.notifications.lock().expect("notifications lock") = Some(handle.notifications);
        *self.handshake.lock().expect("handshake lock") = Some(info);
        Ok(())
    }

    async fn handshake_with(
        &self,
        transport: &dyn ToolTransport,
    ) -> Result<HandshakeInfo, TransportError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });
        let result = transport.request("initialize", params).await?;

        let info = HandshakeInfo {
            server_name: result
                .pointer("/serverInfo/name")
                .and_then(Value::as_str)
                .map(str::to_string),
            server_version: result
                .pointer("/serverInfo/version")
                .and_then(Value::as_str)
                .map(str::to_string),
            capabilities: result.get("capabilities").cloned(),
            instructions: result
                .get("instructions")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        transport
            .notify("notifications/initialized", json!({}))
            .await?;
        debug!(
            server = %self.descriptor.id,
            server_name = info.server_name.as_deref().unwrap_or("unknown"),
            server_version = info.server_version.as_deref().unwrap_or("unknown"),
            "handshake complete"
        );
        Ok(info)
    }

    /// Fetch the server's tool catalog.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let transport = self.live_transport()?;
        let result = transport.request("tools/list", json!({})).await?;

        let mut tools = Vec::new();
        if let Some(items) = result.get("tools").and_then(Value::as_array) {
            for item in items {
                let Some(name) = item.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let requires_confirmation = item
                    .get("requiresConfirmation")
                    .or_else(|| item.get("confirmationRequired"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                tools.push(ToolDescriptor {
                    name: name.to_string(),
                    server_id: self.descriptor.id.clone(),
                    description: item
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    requires_confirmation,
                    input_schema: item.get("inputSchema").cloned(),
                });
            }
        }
        Ok(tools)
    }

    /// Dispatch one tool call. The timeout bounds only this round trip.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let transport = self.live_transport()?;
        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            },
        });
        let timeout_ms = timeout.as_millis() as u64;
        tokio::time::timeout(timeout, transport.request("tools/call", params))
            .await
            .map_err(|_| TransportError::Timeout {
                server: self.descriptor.id.clone(),
                timeout_ms,
            })?
    }

    /// Run one liveness probe. Probes for a given connection never overlap;
    /// concurrent callers queue on the probe gate.
    pub async fn probe(&self, timeout: Duration) -> HealthCheckResult {
        let _gate = self.probe_gate.lock().await;
        let result = match self.state() {
            ConnectionState::Connected => self.probe_connected(timeout).await,
            ConnectionState::Error => {
                HealthCheckResult::unreachable("connection is in error state awaiting recovery")
            }
            other => HealthCheckResult::unreachable(format!(
                "connection is {}, not probed",
                other.as_str()
            )),
        };
        self.record_check(result.clone());
        result
    }

    async fn probe_connected(&self, timeout: Duration) -> HealthCheckResult {
        if self.try_transition(ConnectionState::Checking).is_err() {
            return HealthCheckResult::unreachable("connection left connected state before probe");
        }
        let transport = match self.live_transport() {
            Ok(transport) => transport,
            Err(err) => {
                self.record_failure();
                let _ = self.try_transition(ConnectionState::Error);
                return HealthCheckResult::unhealthy(0, err.to_string());
            }
        };

        let started = tokio::time::Instant::now();
        match tokio::time::timeout(timeout, transport.request("ping", json!({}))).await {
            Ok(Ok(_)) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let _ = self.try_transition(ConnectionState::Connected);
                self.mark_success();
                HealthCheckResult::healthy(latency_ms, self.handshake_metadata())
            }
            Ok(Err(err)) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.record_failure();
                let _ = self.try_transition(ConnectionState::Error);
                HealthCheckResult::unhealthy(latency_ms, err.to_string())
            }
            Err(_) => {
                self.record_failure();
                let _ = self.try_transition(ConnectionState::Error);
                HealthCheckResult::unhealthy(
                    timeout.as_millis() as u64,
                    format!("probe timed out after {}ms", timeout.as_millis()),
                )
            }
        }
    }

    /// A live call hit a genuine transport failure. Routed through the probe
    /// path so the transition stays within the state table.
    pub fn mark_failed(&self) {
        if self.try_transition(ConnectionState::Checking).is_ok() {
            self.record_failure();
            let _ = self.try_transition(ConnectionState::Error);
        }
    }

    pub fn snapshot(&self) -> ServerHealthSnapshot {
        ServerHealthSnapshot {
            server_id: self.descriptor.id.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            recovery_attempts: self.recovery_attempts(),
            created_at: self.created_at,
            last_success_at: *self.last_success_at.lock().expect("last success lock"),
            last_check: self.last_check.lock().expect("last check lock").clone(),
            history: self
                .history
                .lock()
                .expect("history lock")
                .iter()
                .cloned()
                .collect(),
        }
    }

    /// Tear the connection down: stop the notification watcher, close the
    /// transport, and force the terminal state.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.watcher.lock().expect("watcher lock").take() {
            handle.abort();
        }
        let transport = self.transport.lock().expect("transport lock").take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.notifications.lock().expect("notifications lock").take();
        self.force_disconnect();
    }

    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<ServerNotification>> {
        self.notifications.lock().expect("notifications lock").take()
    }

    pub fn attach_watcher(&self, handle: JoinHandle<()>) {
        let mut watcher = self.watcher.lock().expect("watcher lock");
        if let Some(old) = watcher.take() {
            old.abort();
        }
        *watcher = Some(handle);
    }

    fn live_transport(&self) -> Result<Arc<dyn ToolTransport>, TransportError> {
        self.transport
            .lock()
            .expect("transport lock")
            .clone()
            .ok_or_else(|| TransportError::Terminated {
                server: self.descriptor.id.clone(),
            })
    }

    fn handshake_metadata(&self) -> HealthMetadata {
        match self.handshake.lock().expect("handshake lock").as_ref() {
            Some(info) => HealthMetadata {
                server_version: info.server_version.clone(),
                capabilities: info.capabilities.clone(),
            },
            None => HealthMetadata::default(),
        }
    }

    fn mark_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_success_at.lock().expect("last success lock") = Some(Utc::now());
    }

    fn reset_counters(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.recovery_attempts.store(0, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn record_check(&self, result: HealthCheckResult) {
        {
            let mut history = self.history.lock().expect("history lock");
            if history.len() == HEALTH_HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(result.clone());
        }
        *self.last_check.lock().expect("last check lock") = Some(result);
    }
}

/// All live connections, keyed by server id.
#[derive(Default)]
pub struct ServerPool {
    connections: RwLock<HashMap<String, Arc<ServerConnection>>>,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, server_id: &str) -> Option<Arc<ServerConnection>> {
        self.connections
            .read()
            .expect("pool lock")
            .get(server_id)
            .cloned()
    }

    pub fn insert(&self, connection: Arc<ServerConnection>) {
        self.connections
            .write()
            .expect("pool lock")
            .insert(connection.server_id().to_string(), connection);
    }

    pub fn remove(&self, server_id: &str) -> Option<Arc<ServerConnection>> {
        self.connections
            .write()
            .expect("pool lock")
            .remove(server_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.connections
            .read()
            .expect("pool lock")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().expect("pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().expect("pool lock").is_empty()
    }
}

/// Watch server-pushed notifications and keep the catalog current when the
/// server announces a tool-list change.
pub(crate) fn spawn_notification_watcher(
    connection: &Arc<ServerConnection>,
    registry: &Arc<ToolRegistry>,
    events: &Arc<EventBus>,
) {
    let Some(mut notifications) = connection.take_notifications() else {
        return;
    };
    let connection_for_task = Arc::clone(connection);
    let registry = Arc::clone(registry);
    let events = Arc::clone(events);

    let handle = tokio::spawn(async move {
        while let Some(notice) = notifications.recv().await {
            match notice.method.as_str() {
                "notifications/tools/list_changed" => {
                    match connection_for_task.list_tools().await {
                        Ok(tools) => {
                            let count = registry
                                .replace_catalog(connection_for_task.server_id(), tools);
                            events.publish(GatewayEvent::CatalogRegistered {
                                server_id: connection_for_task.server_id().to_string(),
                                tool_count: count,
                            });
                        }
                        Err(err) => {
                            warn!(
                                server = %connection_for_task.server_id(),
                                %err,
                                "failed to refresh tool catalog"
                            );
                        }
                    }
                }
                other => {
                    debug!(
                        server = %connection_for_task.server_id(),
                        method = other,
                        "ignoring server notification"
                    );
                }
            }
        }
    });
    connection.attach_watcher(handle);
}
