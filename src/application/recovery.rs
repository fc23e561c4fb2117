//! Bounded backoff-and-jitter reconnection for failed connections.

use crate::application::connection::{ServerConnection, ServerPool, spawn_notification_watcher};
use crate::application::events::EventBus;
use crate::application::registry::ToolRegistry;
use crate::domain::types::{ConnectionState, GatewayEvent};
use crate::infrastructure::transport::Connector;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Reconnect scheduling policy:
/// `delay = min(base * 2^attempt, max_delay) + uniform(0, jitter)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            max_attempts: 4,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.max_delay.as_millis() as u64);

        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            (rand::random::<f64>() * jitter_ms as f64) as u64
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Schedules reconnects for connections in the error state. Recoveries for
/// different servers run independently; a connection never has more than one
/// recovery task in flight.
pub struct RecoveryManager {
    pool: Arc<ServerPool>,
    registry: Arc<ToolRegistry>,
    connector: Arc<dyn Connector>,
    events: Arc<EventBus>,
    policy: BackoffPolicy,
    connect_timeout: Duration,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RecoveryManager {
    pub fn new(
        pool: Arc<ServerPool>,
        registry: Arc<ToolRegistry>,
        connector: Arc<dyn Connector>,
        events: Arc<EventBus>,
        policy: BackoffPolicy,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry,
            connector,
            events,
            policy,
            connect_timeout,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Start a recovery task for the connection unless one is already in
    /// flight or the connection is not in the error state.
    pub fn ensure_scheduled(self: Arc<Self>, connection: Arc<ServerConnection>) {
        if connection.state() != ConnectionState::Error {
            return;
        }
        if !connection.begin_recovery() {
            return;
        }

        let manager = Arc::clone(&self);
        let server_id = connection.server_id().to_string();
        let handle = tokio::spawn(async move {
            manager.run(Arc::clone(&connection)).await;
            connection.end_recovery();
            manager
                .tasks
                .lock()
                .expect("recovery task lock")
                .remove(connection.server_id());
        });
        self.tasks
            .lock()
            .expect("recovery task lock")
            .insert(server_id, handle);
    }

    /// Abort any in-flight recovery for the server (explicit removal path).
    pub fn cancel(&self, server_id: &str) {
        let handle = self
            .tasks
            .lock()
            .expect("recovery task lock")
            .remove(server_id);
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Some(connection) = self.pool.get(server_id) {
            connection.end_recovery();
        }
    }

    async fn run(&self, connection: Arc<ServerConnection>) {
        let server_id = connection.server_id().to_string();
        loop {
            let attempt = connection.recovery_attempts();
            if attempt >= self.policy.max_attempts {
                self.give_up(&connection, attempt);
                return;
            }

            let delay = self.policy.delay_for_attempt(attempt);
            info!(
                server = %server_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;

            // The connection may have been removed while we slept.
            if connection
                .try_transition(ConnectionState::Recovering)
                .is_err()
            {
                return;
            }

            match connection.reopen(self.connector.as_ref(), self.connect_timeout).await {
                Ok(()) => {
                    info!(server = %server_id, attempt, "tool server reconnected");
                    match connection.list_tools().await {
                        Ok(tools) => {
                            let count = self.registry.replace_catalog(&server_id, tools);
                            self.events.publish(GatewayEvent::CatalogRegistered {
                                server_id: server_id.clone(),
                                tool_count: count,
                            });
                        }
                        Err(err) => {
                            warn!(server = %server_id, %err, "reconnected but catalog fetch failed");
                        }
                    }
                    spawn_notification_watcher(&connection, &self.registry, &self.events);
                    self.events.publish(GatewayEvent::ServerRecovered {
                        server_id: server_id.clone(),
                        attempts: attempt,
                    });
                    return;
                }
                Err(err) => {
                    let attempts = connection.increment_recovery_attempts();
                    warn!(
                        server = %server_id,
                        attempts,
                        %err,
                        "reconnect attempt failed"
                    );
                }
            }
        }
    }

    fn give_up(&self, connection: &ServerConnection, attempts: u32) {
        let server_id = connection.server_id().to_string();
        warn!(
            server = %server_id,
            attempts,
            "recovery exhausted, disconnecting server"
        );
        connection.force_disconnect();
        let evicted = self.registry.unregister_server(&server_id);
        if evicted > 0 {
            self.events.publish(GatewayEvent::CatalogEvicted {
                server_id: server_id.clone(),
            });
        }
        self.events.publish(GatewayEvent::RecoveryExhausted {
            server_id,
            attempts,
        });
    }
}
