pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::events::{EventBus, SubscriptionId};
pub use application::gateway::{ExecutionGateway, GatewayConfig, InvokeContext};
pub use application::orchestrator::{LoadingMode, ServerStartup, StartupOutcome, StartupReport};
pub use application::recovery::BackoffPolicy;
pub use application::registry::{GrantStatus, ToolRegistry};
pub use config::{DescriptorError, DescriptorSource, ServerDescriptor, StaticDescriptorSource, TransportKind};
pub use domain::types::{
    ConnectionState, EventKind, GatewayEvent, HealthCheckResult, HealthStatus, InvokeOutcome,
    ServerHealthSnapshot, ToolDescriptor,
};
pub use infrastructure::transport::{
    Connector, ProcessConnector, ServerNotification, ToolTransport, TransportError, TransportHandle,
};
