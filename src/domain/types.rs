use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of one tool-server connection.
///
/// A connection occupies exactly one state at any instant. All transitions go
/// through [`can_transition_to`](ConnectionState::can_transition_to); the only
/// path outside the table is the forced disconnect used by explicit removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Checking,
    Error,
    Recovering,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Checking => "checking",
            ConnectionState::Error => "error",
            ConnectionState::Recovering => "recovering",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Checking)
                | (Checking, Connected)
                | (Checking, Error)
                | (Error, Recovering)
                | (Recovering, Connected)
                | (Recovering, Error)
                | (Recovering, Disconnected)
        )
    }
}

/// Outcome classification of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The server answered the liveness request in time.
    Healthy,
    /// The server was probed and failed (timeout or transport error).
    Unhealthy,
    /// The server was not probed because no live channel exists.
    Unreachable,
}

/// Version and capability metadata captured during the protocol handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthMetadata {
    pub server_version: Option<String>,
    pub capabilities: Option<Value>,
}

/// One health probe result. Immutable; appended to the connection's bounded
/// history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub success: bool,
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub metadata: HealthMetadata,
}

impl HealthCheckResult {
    pub fn healthy(latency_ms: u64, metadata: HealthMetadata) -> Self {
        Self {
            success: true,
            status: HealthStatus::Healthy,
            latency_ms,
            error: None,
            checked_at: Utc::now(),
            metadata,
        }
    }

    pub fn unhealthy(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: HealthStatus::Unhealthy,
            latency_ms,
            error: Some(error.into()),
            checked_at: Utc::now(),
            metadata: HealthMetadata::default(),
        }
    }

    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: HealthStatus::Unreachable,
            latency_ms: 0,
            error: Some(error.into()),
            checked_at: Utc::now(),
            metadata: HealthMetadata::default(),
        }
    }
}

/// A named callable capability exposed by a connected tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    /// Id of the server that registered this tool.
    pub server_id: String,
    pub description: Option<String>,
    #[serde(default, alias = "requiresConfirmation")]
    pub requires_confirmation: bool,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Option<Value>,
}

/// Discriminated result of one gateway invocation.
///
/// `ConfirmationRequired` and `NotFound` are expected control-flow signals,
/// not faults; callers match on the variant instead of discriminating errors.
#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    Success { result: Value, elapsed_ms: u64 },
    ConfirmationRequired { tool: String },
    NotFound { tool: String },
    Unavailable {
        tool: String,
        server_id: String,
        state: ConnectionState,
    },
    Failed { tool: String, message: String },
}

impl InvokeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvokeOutcome::Success { .. })
    }
}

/// Point-in-time view of one connection, exposed through the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealthSnapshot {
    pub server_id: String,
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_check: Option<HealthCheckResult>,
    pub history: Vec<HealthCheckResult>,
}

/// Subscription buckets for the gateway event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Health,
    Recovery,
    Catalog,
    Removal,
}

/// Events published by the connection lifecycle components.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    HealthChanged {
        server_id: String,
        result: HealthCheckResult,
    },
    ServerRecovered {
        server_id: String,
        attempts: u32,
    },
    RecoveryExhausted {
        server_id: String,
        attempts: u32,
    },
    CatalogRegistered {
        server_id: String,
        tool_count: usize,
    },
    CatalogEvicted {
        server_id: String,
    },
    ServerRemoved {
        server_id: String,
    },
}

impl GatewayEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GatewayEvent::HealthChanged { .. } => EventKind::Health,
            GatewayEvent::ServerRecovered { .. } | GatewayEvent::RecoveryExhausted { .. } => {
                EventKind::Recovery
            }
            GatewayEvent::CatalogRegistered { .. } | GatewayEvent::CatalogEvicted { .. } => {
                EventKind::Catalog
            }
            GatewayEvent::ServerRemoved { .. } => EventKind::Removal,
        }
    }

    pub fn server_id(&self) -> &str {
        match self {
            GatewayEvent::HealthChanged { server_id, .. }
            | GatewayEvent::ServerRecovered { server_id, .. }
            | GatewayEvent::RecoveryExhausted { server_id, .. }
            | GatewayEvent::CatalogRegistered { server_id, .. }
            | GatewayEvent::CatalogEvicted { server_id }
            | GatewayEvent::ServerRemoved { server_id } => server_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn connect_cycle_transitions_are_legal() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Error));
        assert!(Connected.can_transition_to(Checking));
        assert!(Checking.can_transition_to(Connected));
        assert!(Checking.can_transition_to(Error));
    }

    #[test]
    fn recovery_transitions_are_legal() {
        assert!(Error.can_transition_to(Recovering));
        assert!(Recovering.can_transition_to(Connected));
        assert!(Recovering.can_transition_to(Error));
        assert!(Recovering.can_transition_to(Disconnected));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Error));
        assert!(!Connected.can_transition_to(Recovering));
        assert!(!Error.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Checking));
        assert!(!Checking.can_transition_to(Recovering));
        assert!(!Disconnected.can_transition_to(Recovering));
    }

    #[test]
    fn event_kinds_route_to_their_bucket() {
        let health = GatewayEvent::HealthChanged {
            server_id: "s".into(),
            result: HealthCheckResult::unreachable("down"),
        };
        assert_eq!(health.kind(), EventKind::Health);
        assert_eq!(health.server_id(), "s");

        let exhausted = GatewayEvent::RecoveryExhausted {
            server_id: "s".into(),
            attempts: 4,
        };
        assert_eq!(exhausted.kind(), EventKind::Recovery);

        let removed = GatewayEvent::ServerRemoved { server_id: "s".into() };
        assert_eq!(removed.kind(), EventKind::Removal);
    }

    #[test]
    fn tool_descriptor_accepts_camel_case_aliases() {
        let json = r#"{
            "name": "delete_file",
            "server_id": "fs",
            "description": "Delete a file",
            "requiresConfirmation": true,
            "inputSchema": {"type": "object"}
        }"#;
        let tool: ToolDescriptor = serde_json::from_str(json).expect("valid descriptor");
        assert!(tool.requires_confirmation);
        assert!(tool.input_schema.is_some());
    }
}
