pub mod config;
pub mod handler;
pub mod health;
pub mod orchestrator;
pub mod subprocess_channel;

pub use config::{
    CollisionPolicyDto, DnsGuardSettings, GatewayConfig, NamespaceSettings, NamespaceStrategyDto,
    SessionSettings, TransportConfig, UpstreamAuthConfig, UpstreamServerConfig,
};
pub use handler::GatewayHandler;
pub use health::HealthState;
pub use orchestrator::{Gateway, GatewayError, is_accepting_sessions};
pub use subprocess_channel::{SubprocessChannel, subprocess_config};
