//! Single public facade: lookup, confirmation gate, dispatch, and result
//! normalization.

use crate::application::connection::ServerPool;
use crate::application::events::{EventBus, SubscriptionId};
use crate::application::health::HealthMonitor;
use crate::application::orchestrator::{LoadingMode, LoadingOrchestrator, StartupReport};
use crate::application::recovery::{BackoffPolicy, RecoveryManager};
use crate::application::registry::{GrantStatus, ToolRegistry};
use crate::config::DescriptorSource;
use crate::domain::types::{
    ConnectionState, EventKind, GatewayEvent, HealthCheckResult, InvokeOutcome,
    ServerHealthSnapshot, ToolDescriptor,
};
use crate::infrastructure::transport::Connector;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Timeouts and policies shared by the gateway's components.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub health_interval: Duration,
    pub call_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Caller-scoped invocation settings.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub request_id: String,
    /// Overrides the gateway's default call timeout. Aborting the wait does
    /// not touch the connection.
    pub timeout: Option<Duration>,
}

impl InvokeContext {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for InvokeContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The only entry point invocation callers use. Owns the pool, registry
/// wiring, health monitor, and recovery manager for one descriptor source.
pub struct ExecutionGateway {
    registry: Arc<ToolRegistry>,
    pool: Arc<ServerPool>,
    events: Arc<EventBus>,
    health: Arc<HealthMonitor>,
    recovery: Arc<RecoveryManager>,
    orchestrator: Arc<LoadingOrchestrator>,
    config: GatewayConfig,
}

impl ExecutionGateway {
    /// Wire a gateway around an explicitly constructed descriptor source and
    /// registry, so independent instances can coexist in one process.
    pub fn new(
        source: Arc<dyn DescriptorSource>,
        registry: Arc<ToolRegistry>,
        connector: Arc<dyn Connector>,
        config: GatewayConfig,
    ) -> Self {
        let pool = Arc::new(ServerPool::new());
        let events = Arc::new(EventBus::new());
        let recovery = RecoveryManager::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::clone(&connector),
            Arc::clone(&events),
            config.backoff.clone(),
            config.connect_timeout,
        );
        let health = HealthMonitor::new(
            Arc::clone(&pool),
            Arc::clone(&events),
            Arc::clone(&recovery),
            config.probe_timeout,
        );
        let orchestrator = LoadingOrchestrator::new(
            source,
            Arc::clone(&pool),
            Arc::clone(&registry),
            connector,
            Arc::clone(&events),
            Arc::clone(&health),
            Arc::clone(&recovery),
            config.connect_timeout,
            config.health_interval,
        );
        Self {
            registry,
            pool,
            events,
            health,
            recovery,
            orchestrator,
            config,
        }
    }

    /// Start the servers the mode selects. Readiness is reported once every
    /// selected server reached CONNECTED or ERROR.
    pub async fn start(&self, mode: LoadingMode, request: Option<&str>) -> StartupReport {
        Arc::clone(&self.orchestrator).start(mode, request).await
    }

    pub fn list_available_tools(&self) -> Vec<ToolDescriptor> {
        self.registry.list()
    }

    /// Set a one-shot grant for a confirmation-gated tool.
    pub fn grant_confirmation(&self, tool: &str) -> bool {
        self.registry.grant_confirmation(tool)
    }

    /// The sole execution path for tool invocations.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        context: InvokeContext,
    ) -> InvokeOutcome {
        let Some(descriptor) = self.registry.resolve(tool) else {
            debug!(request_id = %context.request_id, tool, "tool not registered");
            return InvokeOutcome::NotFound {
                tool: tool.to_string(),
            };
        };

        if descriptor.requires_confirmation {
            match self.registry.try_consume_grant(tool) {
                GrantStatus::Consumed => {
                    debug!(request_id = %context.request_id, tool, "confirmation grant consumed");
                }
                // Returned without contacting the server and without
                // mutating any grant.
                GrantStatus::NoGrant => {
                    return InvokeOutcome::ConfirmationRequired {
                        tool: tool.to_string(),
                    };
                }
                GrantStatus::UnknownTool => {
                    return InvokeOutcome::NotFound {
                        tool: tool.to_string(),
                    };
                }
            }
        }

        let Some(connection) = self.pool.get(&descriptor.server_id) else {
            return InvokeOutcome::NotFound {
                tool: tool.to_string(),
            };
        };

        let state = connection.state();
        // CHECKING still has a live channel; only a probe is in flight.
        if !matches!(state, ConnectionState::Connected | ConnectionState::Checking) {
            return InvokeOutcome::Unavailable {
                tool: tool.to_string(),
                server_id: descriptor.server_id.clone(),
                state,
            };
        }

        let timeout = context.timeout.unwrap_or(self.config.call_timeout);
        let started = tokio::time::Instant::now();
        debug!(
            request_id = %context.request_id,
            tool,
            server = %descriptor.server_id,
            "dispatching tool invocation"
        );

        match connection.call_tool(&descriptor.name, arguments, timeout).await {
            Ok(result) => InvokeOutcome::Success {
                result,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
            Err(err) => {
                if !err.is_server_answer()
                    && !matches!(err, crate::infrastructure::transport::TransportError::Timeout { .. })
                {
                    // Genuine channel failure: degrade the connection and let
                    // recovery take over. An answered error or a caller-scoped
                    // timeout leaves the connection alone.
                    connection.mark_failed();
                    Arc::clone(&self.recovery).ensure_scheduled(Arc::clone(&connection));
                }
                InvokeOutcome::Failed {
                    tool: tool.to_string(),
                    message: err.to_string(),
                }
            }
        }
    }

    /// Run one health probe immediately.
    pub async fn check_server(&self, server_id: &str) -> Option<HealthCheckResult> {
        self.health.check(server_id).await
    }

    pub fn server_health(&self, server_id: &str) -> Option<ServerHealthSnapshot> {
        Some(self.pool.get(server_id)?.snapshot())
    }

    /// Remove a server: cancels in-flight probes and recoveries, tears down
    /// the connection, and evicts its tools (invalidating any grants).
    pub async fn remove_server(&self, server_id: &str) -> bool {
        self.health.cancel(server_id);
        self.recovery.cancel(server_id);

        let Some(connection) = self.pool.remove(server_id) else {
            return false;
        };
        connection.shutdown().await;

        let evicted = self.registry.unregister_server(server_id);
        if evicted > 0 {
            self.events.publish(GatewayEvent::CatalogEvicted {
                server_id: server_id.to_string(),
            });
        }
        self.events.publish(GatewayEvent::ServerRemoved {
            server_id: server_id.to_string(),
        });
        info!(server = %server_id, evicted_tools = evicted, "server removed");
        true
    }

    /// Remove every server.
    pub async fn shutdown(&self) {
        for server_id in self.pool.ids() {
            self.remove_server(&server_id).await;
        }
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&GatewayEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_contexts_get_distinct_request_ids() {
        let a = InvokeContext::new();
        let b = InvokeContext::new();
        assert_ne!(a.request_id, b.request_id);
        assert!(a.timeout.is_none());
    }

    #[test]
    fn context_timeout_override() {
        let ctx = InvokeContext::new().with_timeout(Duration::from_millis(250));
        assert_eq!(ctx.timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn default_config_matches_documented_timeouts() {
        let config = GatewayConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.health_interval, Duration::from_secs(30));
    }
}
