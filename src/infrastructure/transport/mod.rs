pub mod sse;
pub mod stdio;

use crate::config::{ServerDescriptor, TransportKind};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Protocol revision advertised during the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn tool server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tool server '{server}' handshake failed: {message}")]
    Handshake { server: String, message: String },
    #[error("tool server '{server}' transport error: {message}")]
    Transport { server: String, message: String },
    #[error("tool server '{server}' returned invalid JSON: {source}")]
    InvalidJson {
        server: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("tool server '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
    #[error("tool server '{server}' terminated unexpectedly")]
    Terminated { server: String },
    #[error("request to tool server '{server}' timed out after {timeout_ms}ms")]
    Timeout { server: String, timeout_ms: u64 },
    #[error("tool server '{server}' has no endpoint configured")]
    NotConfigured { server: String },
}

impl TransportError {
    /// Whether the error came from the server answering (as opposed to the
    /// channel itself failing). An answered error leaves the channel usable.
    pub fn is_server_answer(&self) -> bool {
        matches!(self, TransportError::Rpc { .. })
    }
}

/// A request or notification pushed by the server outside the
/// request/response cycle.
#[derive(Debug, Clone)]
pub struct ServerNotification {
    pub method: String,
    pub params: Value,
}

/// One bidirectional JSON-RPC channel to a tool server process or endpoint.
///
/// Implementations multiplex concurrent requests; callers apply their own
/// per-call timeouts.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError>;

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError>;

    async fn close(&self);
}

/// A freshly opened channel plus the stream of server-pushed notifications.
pub struct TransportHandle {
    pub transport: Arc<dyn ToolTransport>,
    pub notifications: mpsc::UnboundedReceiver<ServerNotification>,
}

/// Opens transports for descriptors. The production connector dispatches on
/// the descriptor's transport kind; tests substitute simulated channels.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, descriptor: &ServerDescriptor)
    -> Result<TransportHandle, TransportError>;
}

/// Default connector: spawns a child process for stdio descriptors and opens
/// an event-stream session for sse descriptors.
pub struct ProcessConnector;

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<TransportHandle, TransportError> {
        match descriptor.transport {
            TransportKind::Stdio => {
                let (transport, notifications) = stdio::StdioTransport::spawn(descriptor).await?;
                Ok(TransportHandle {
                    transport: Arc::new(transport),
                    notifications,
                })
            }
            TransportKind::Sse => {
                let (transport, notifications) = sse::SseTransport::connect(descriptor).await?;
                Ok(TransportHandle {
                    transport: Arc::new(transport),
                    notifications,
                })
            }
        }
    }
}
