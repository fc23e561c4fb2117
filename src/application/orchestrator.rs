//! Chooses which tool servers to start for a request and runs the startup.

use crate::application::connection::{ServerConnection, ServerPool, spawn_notification_watcher};
use crate::application::events::EventBus;
use crate::application::health::HealthMonitor;
use crate::application::recovery::RecoveryManager;
use crate::application::registry::ToolRegistry;
use crate::config::{DescriptorSource, ServerDescriptor};
use crate::domain::types::{ConnectionState, GatewayEvent};
use crate::infrastructure::transport::Connector;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Startup strategy for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadingMode {
    /// Start every descriptor. Highest latency, highest completeness.
    Full,
    /// Start only servers matching the supplied categories.
    Selective(Vec<String>),
    /// Infer categories from the request text; falls back to a small
    /// default set, never to an empty one.
    Smart,
    /// Built-in tools only; no external process is started.
    Speed,
}

/// Keyword table for smart-mode category inference. Matching is
/// case-insensitive substring over the request text.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("time", &["time", "clock", "date", "timezone", "alarm"]),
    ("filesystem", &["file", "folder", "directory", "path"]),
    ("web", &["http", "url", "website", "search", "browse", "fetch", "download"]),
    ("data", &["database", "sql", "query", "csv", "spreadsheet"]),
    ("system", &["process", "memory", "cpu", "clipboard", "screenshot"]),
];

/// Categories assumed when no keyword matches.
const DEFAULT_SMART_CATEGORIES: &[&str] = &["time", "filesystem"];

/// Infer tool categories from request text.
pub fn match_categories(request: &str) -> Vec<String> {
    let lowered = request.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|keyword| lowered.contains(keyword)))
        .map(|(category, _)| category.to_string())
        .collect()
}

/// Result of one server's startup attempt.
#[derive(Debug, Clone)]
pub struct ServerStartup {
    pub server_id: String,
    pub outcome: StartupOutcome,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub enum StartupOutcome {
    Connected { tool_count: usize },
    Failed { error: String },
}

impl ServerStartup {
    pub fn is_connected(&self) -> bool {
        matches!(self.outcome, StartupOutcome::Connected { .. })
    }
}

/// Per-server startup results. Failures are reported individually; a slow or
/// failing server never turns the whole startup into an error.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub servers: Vec<ServerStartup>,
}

impl StartupReport {
    pub fn loaded(&self) -> usize {
        self.servers.iter().filter(|s| s.is_connected()).count()
    }

    pub fn failed(&self) -> usize {
        self.servers.len() - self.loaded()
    }

    pub fn total_tools(&self) -> usize {
        self.servers
            .iter()
            .filter_map(|s| match &s.outcome {
                StartupOutcome::Connected { tool_count } => Some(*tool_count),
                StartupOutcome::Failed { .. } => None,
            })
            .sum()
    }
}

pub struct LoadingOrchestrator {
    source: Arc<dyn DescriptorSource>,
    pool: Arc<ServerPool>,
    registry: Arc<ToolRegistry>,
    connector: Arc<dyn Connector>,
    events: Arc<EventBus>,
    health: Arc<HealthMonitor>,
    recovery: Arc<RecoveryManager>,
    connect_timeout: Duration,
    health_interval: Duration,
}

impl LoadingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn DescriptorSource>,
        pool: Arc<ServerPool>,
        registry: Arc<ToolRegistry>,
        connector: Arc<dyn Connector>,
        events: Arc<EventBus>,
        health: Arc<HealthMonitor>,
        recovery: Arc<RecoveryManager>,
        connect_timeout: Duration,
        health_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            pool,
            registry,
            connector,
            events,
            health,
            recovery,
            connect_timeout,
            health_interval,
        })
    }

    /// Narrow the descriptor set for the given mode.
    pub fn select(&self, mode: &LoadingMode, request: Option<&str>) -> Vec<ServerDescriptor> {
        let all = self.source.descriptors();
        match mode {
            LoadingMode::Full => all,
            LoadingMode::Speed => Vec::new(),
            LoadingMode::Selective(categories) => filter_by_categories(all, categories),
            LoadingMode::Smart => {
                let mut categories = match_categories(request.unwrap_or(""));
                if categories.is_empty() {
                    debug!("no keyword matched, using default category set");
                    categories = DEFAULT_SMART_CATEGORIES
                        .iter()
                        .map(|c| c.to_string())
                        .collect();
                }
                let selected = filter_by_categories(all.clone(), &categories);
                if selected.is_empty() {
                    // Smart mode never yields an empty start set while
                    // descriptors exist.
                    info!("no descriptor matched the inferred categories, starting full set");
                    all
                } else {
                    selected
                }
            }
        }
    }

    /// Start every selected server concurrently, each under its own connect
    /// timeout. Returns once all of them reached CONNECTED or ERROR.
    pub async fn start(
        self: Arc<Self>,
        mode: LoadingMode,
        request: Option<&str>,
    ) -> StartupReport {
        let selected = self.select(&mode, request);
        if selected.is_empty() {
            info!(mode = ?mode, "no tool servers selected");
            return StartupReport::default();
        }

        info!(count = selected.len(), mode = ?mode, "starting tool servers");
        let mut handles = Vec::with_capacity(selected.len());
        for descriptor in selected {
            let orchestrator = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                orchestrator.start_one(descriptor).await
            }));
        }

        let mut servers = Vec::new();
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(startup) => servers.push(startup),
                Err(err) => warn!(%err, "startup task panicked"),
            }
        }
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        let report = StartupReport { servers };
        log_summary(&report);
        report
    }

    async fn start_one(&self, descriptor: ServerDescriptor) -> ServerStartup {
        let started = tokio::time::Instant::now();
        let server_id = descriptor.id.clone();

        if let Some(existing) = self.pool.get(&server_id) {
            if existing.state() == ConnectionState::Connected {
                debug!(server = %server_id, "server already connected");
                return ServerStartup {
                    outcome: StartupOutcome::Connected {
                        tool_count: self.registry.tools_for_server(&server_id),
                    },
                    server_id,
                    elapsed_ms: 0,
                };
            }
            // Replace a stale (failed or exhausted) connection.
            self.health.cancel(&server_id);
            self.recovery.cancel(&server_id);
            existing.shutdown().await;
            self.pool.remove(&server_id);
        }

        let connection = ServerConnection::new(descriptor);
        self.pool.insert(Arc::clone(&connection));

        let outcome = match connection
            .establish(self.connector.as_ref(), self.connect_timeout)
            .await
        {
            Ok(()) => {
                let tool_count = match connection.list_tools().await {
                    Ok(tools) => {
                        let count = self.registry.replace_catalog(&server_id, tools);
                        self.events.publish(GatewayEvent::CatalogRegistered {
                            server_id: server_id.clone(),
                            tool_count: count,
                        });
                        count
                    }
                    Err(err) => {
                        warn!(server = %server_id, %err, "connected but catalog fetch failed");
                        0
                    }
                };
                spawn_notification_watcher(&connection, &self.registry, &self.events);
                StartupOutcome::Connected { tool_count }
            }
            Err(err) => {
                Arc::clone(&self.recovery).ensure_scheduled(Arc::clone(&connection));
                StartupOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };

        // Probing covers both live and erroring connections; recovery owns
        // the reconnect itself.
        self.health.schedule(&server_id, self.health_interval);

        ServerStartup {
            server_id,
            outcome,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn filter_by_categories(
    descriptors: Vec<ServerDescriptor>,
    categories: &[String],
) -> Vec<ServerDescriptor> {
    descriptors
        .into_iter()
        .filter(|descriptor| descriptor.matches_categories(categories))
        .collect()
}

fn log_summary(report: &StartupReport) {
    for startup in &report.servers {
        match &startup.outcome {
            StartupOutcome::Connected { tool_count } => {
                info!(
                    server = %startup.server_id,
                    tools = tool_count,
                    elapsed_ms = startup.elapsed_ms,
                    "server ready"
                );
            }
            StartupOutcome::Failed { error } => {
                error!(
                    server = %startup.server_id,
                    %error,
                    elapsed_ms = startup.elapsed_ms,
                    "server failed to start"
                );
            }
        }
    }
    info!(
        total = report.servers.len(),
        loaded = report.loaded(),
        failed = report.failed(),
        total_tools = report.total_tools(),
        "tool server startup complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_prompt_selects_only_the_time_category() {
        let categories = match_categories("What time is it?");
        assert_eq!(categories, vec!["time".to_string()]);
    }

    #[test]
    fn unmatched_prompt_yields_no_categories() {
        assert!(match_categories("tell me a joke").is_empty());
    }

    #[test]
    fn matching_is_case_insensitive() {
        let categories = match_categories("Run an SQL QUERY against the DATABASE");
        assert_eq!(categories, vec!["data".to_string()]);
    }

    #[test]
    fn multiple_categories_can_match() {
        let categories = match_categories("search the web for a file");
        assert!(categories.contains(&"filesystem".to_string()));
        assert!(categories.contains(&"web".to_string()));
    }

    #[test]
    fn default_category_set_is_non_empty() {
        assert!(!DEFAULT_SMART_CATEGORIES.is_empty());
    }
}
