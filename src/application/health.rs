//! Periodic liveness probing for connected servers.

use crate::application::connection::{ServerConnection, ServerPool};
use crate::application::events::EventBus;
use crate::application::recovery::RecoveryManager;
use crate::domain::types::{ConnectionState, GatewayEvent, HealthCheckResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Schedules probes against live connections and records their results.
///
/// One probing task per server; a server's probes are serialized by the
/// connection's probe gate, so an interval tick never overlaps a manual
/// `check` for the same server.
pub struct HealthMonitor {
    pool: Arc<ServerPool>,
    events: Arc<EventBus>,
    recovery: Arc<RecoveryManager>,
    probe_timeout: Duration,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<ServerPool>,
        events: Arc<EventBus>,
        recovery: Arc<RecoveryManager>,
        probe_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            events,
            recovery,
            probe_timeout,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Start periodic probing for a server. Replaces any previous schedule.
    pub fn schedule(&self, server_id: &str, interval: Duration) {
        let pool = Arc::clone(&self.pool);
        let events = Arc::clone(&self.events);
        let recovery = Arc::clone(&self.recovery);
        let probe_timeout = self.probe_timeout;
        let id = server_id.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; scheduling must not probe a
            // server that just finished its connect handshake.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(connection) = pool.get(&id) else {
                    debug!(server = %id, "server left the pool, stopping health schedule");
                    break;
                };
                // Only live and erroring connections are probed; connects
                // and recoveries are owned by their own tasks.
                if matches!(
                    connection.state(),
                    ConnectionState::Connected | ConnectionState::Error
                ) {
                    probe_once(&connection, probe_timeout, &events, &recovery).await;
                }
            }
        });

        let mut tasks = self.tasks.lock().expect("health task lock");
        if let Some(old) = tasks.insert(server_id.to_string(), handle) {
            old.abort();
        }
    }

    /// Run one probe immediately. Returns `None` for unknown servers.
    pub async fn check(&self, server_id: &str) -> Option<HealthCheckResult> {
        let connection = self.pool.get(server_id)?;
        Some(probe_once(&connection, self.probe_timeout, &self.events, &self.recovery).await)
    }

    /// Stop periodic probing for a server.
    pub fn cancel(&self, server_id: &str) {
        let handle = self
            .tasks
            .lock()
            .expect("health task lock")
            .remove(server_id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

async fn probe_once(
    connection: &Arc<ServerConnection>,
    probe_timeout: Duration,
    events: &Arc<EventBus>,
    recovery: &Arc<RecoveryManager>,
) -> HealthCheckResult {
    let result = connection.probe(probe_timeout).await;
    events.publish(GatewayEvent::HealthChanged {
        server_id: connection.server_id().to_string(),
        result: result.clone(),
    });
    if !result.success && connection.state() == ConnectionState::Error {
        Arc::clone(recovery).ensure_scheduled(Arc::clone(connection));
    }
    result
}
