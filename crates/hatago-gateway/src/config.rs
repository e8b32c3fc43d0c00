//! Gateway configuration types (§ Configuration, AMBIENT STACK). Config file
//! parsing/validation lives outside the core; these types are the
//! already-validated value an external front-end hands to the orchestrator,
//! mirroring `turbomcp-proxy::config::ProxyConfig`'s `Serialize`/`Deserialize`
//! shape.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hatago_proxy::{CollisionPolicy, NamespaceStrategy};
use hatago_transport::DnsRebindingGuardConfig;

/// How an upstream's auth credential arrives in config. The secret value
/// itself is read once at startup and immediately wrapped in
/// `secrecy::SecretString`; this DTO only needs to exist long enough to be
/// deserialized and consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamAuthConfig {
    Bearer { token: String },
    Basic { username: String, password: String },
    Custom { headers: HashMap<String, String> },
}

/// One upstream MCP server: either reached over HTTP or spawned as a
/// subprocess speaking stdio.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum UpstreamServerConfig {
    Http {
        id: String,
        endpoint: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth: Option<UpstreamAuthConfig>,
        #[serde(default = "default_upstream_timeout")]
        timeout: Duration,
        #[serde(flatten)]
        namespace: NamespaceSettings,
    },
    Subprocess {
        id: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        working_directory: Option<String>,
        #[serde(default)]
        environment: Vec<(String, String)>,
        #[serde(default = "default_graceful_timeout")]
        graceful_timeout: Duration,
        #[serde(default)]
        restart_on_failure: bool,
        #[serde(default = "default_max_restarts")]
        max_restarts: u32,
        #[serde(flatten)]
        namespace: NamespaceSettings,
    },
}

impl UpstreamServerConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::Http { id, .. } | Self::Subprocess { id, .. } => id,
        }
    }
}

fn default_upstream_timeout() -> Duration {
    Duration::from_millis(30_000)
}

fn default_graceful_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_restarts() -> u32 {
    3
}

/// The namespace-relevant subset of `UpstreamServerConfig`, flattened onto
/// both transport variants so every upstream carries the same naming knobs
/// regardless of how it's reached (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceSettings {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub rename: HashMap<String, String>,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_max_name_length")]
    pub max_length: usize,
    #[serde(default)]
    pub strategy: NamespaceStrategyDto,
}

fn default_separator() -> String {
    ":".to_string()
}

fn default_max_name_length() -> usize {
    64
}

impl Default for NamespaceSettings {
    fn default() -> Self {
        Self {
            namespace: None,
            include: Vec::new(),
            exclude: Vec::new(),
            rename: HashMap::new(),
            separator: default_separator(),
            max_length: default_max_name_length(),
            strategy: NamespaceStrategyDto::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceStrategyDto {
    #[default]
    Prefix,
    Suffix,
}

impl From<NamespaceStrategyDto> for NamespaceStrategy {
    fn from(value: NamespaceStrategyDto) -> Self {
        match value {
            NamespaceStrategyDto::Prefix => NamespaceStrategy::Prefix,
            NamespaceStrategyDto::Suffix => NamespaceStrategy::Suffix,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicyDto {
    Error,
    Skip,
    #[default]
    Rename,
}

impl From<CollisionPolicyDto> for CollisionPolicy {
    fn from(value: CollisionPolicyDto) -> Self {
        match value {
            CollisionPolicyDto::Error => CollisionPolicy::Error,
            CollisionPolicyDto::Skip => CollisionPolicy::Skip,
            CollisionPolicyDto::Rename => CollisionPolicy::Rename { prefix_format: None },
        }
    }
}

/// Session lifecycle knobs, mirroring `hatago_transport::SessionManagerConfig`
/// but serde-able; converted at orchestrator startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_session_ttl")]
    pub ttl: Duration,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            ttl: default_session_ttl(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl From<SessionSettings> for hatago_transport::SessionManagerConfig {
    fn from(value: SessionSettings) -> Self {
        Self {
            max_sessions: value.max_sessions,
            ttl: value.ttl,
            cleanup_interval: value.cleanup_interval,
        }
    }
}

/// Selects and configures one of the two transports (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TransportConfig {
    Http {
        #[serde(default = "default_hostname")]
        hostname: String,
        #[serde(default = "default_port")]
        port: u16,
        #[serde(default = "default_endpoint_path")]
        endpoint_path: String,
        #[serde(default = "default_keep_alive")]
        keep_alive: Duration,
        #[serde(default = "default_max_message_size")]
        max_message_size: usize,
        #[serde(default = "default_max_queue_size")]
        max_queue_size: usize,
        #[serde(default = "default_replay_buffer_size")]
        replay_buffer_size: usize,
        #[serde(default)]
        dns_guard: DnsGuardSettings,
    },
    Stdio {
        #[serde(default = "default_max_message_size")]
        max_message_size: usize,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Http {
            hostname: default_hostname(),
            port: default_port(),
            endpoint_path: default_endpoint_path(),
            keep_alive: default_keep_alive(),
            max_message_size: default_max_message_size(),
            max_queue_size: default_max_queue_size(),
            replay_buffer_size: default_replay_buffer_size(),
            dns_guard: DnsGuardSettings::default(),
        }
    }
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_endpoint_path() -> String {
    "/mcp".to_string()
}
fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}
fn default_max_message_size() -> usize {
    4 * 1024 * 1024
}
fn default_max_queue_size() -> usize {
    1024
}
fn default_replay_buffer_size() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsGuardSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_localhost: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DnsGuardSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_hosts: Vec::new(),
            allowed_origins: Vec::new(),
            allow_localhost: true,
        }
    }
}

impl From<DnsGuardSettings> for DnsRebindingGuardConfig {
    fn from(value: DnsGuardSettings) -> Self {
        Self {
            enabled: value.enabled,
            allowed_hosts: value.allowed_hosts.into_iter().collect(),
            allowed_origins: value.allowed_origins.into_iter().collect(),
            allow_localhost: value.allow_localhost,
        }
    }
}

/// Top-level configuration the orchestrator (C9) builds a gateway from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_server_version")]
    pub server_version: String,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default = "default_collision_policy")]
    pub collision_policy: CollisionPolicyDto,
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout: Duration,
    #[serde(default)]
    pub upstreams: Vec<UpstreamServerConfig>,
}

fn default_server_name() -> String {
    "hatago-gateway".to_string()
}
fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_collision_policy() -> CollisionPolicyDto {
    CollisionPolicyDto::Rename
}
fn default_graceful_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            server_version: default_server_version(),
            transport: TransportConfig::default(),
            session: SessionSettings::default(),
            collision_policy: default_collision_policy(),
            graceful_shutdown_timeout: default_graceful_shutdown_timeout(),
            upstreams: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Apply just the six environment variables named in §6, on top of an
    /// already-built config. Never reads a file; never consults any other
    /// env var.
    pub fn apply_env_overlay(mut self, env: &HashMap<String, String>) -> Self {
        if let Some(mode) = env.get("HATAGO_TRANSPORT") {
            self.transport = match (mode.as_str(), &self.transport) {
                ("stdio", _) => TransportConfig::Stdio {
                    max_message_size: default_max_message_size(),
                },
                ("http", TransportConfig::Http { .. }) => self.transport.clone(),
                ("http", TransportConfig::Stdio { .. }) => TransportConfig::default(),
                _ => self.transport.clone(),
            };
        }
        if let TransportConfig::Http { hostname, port, .. } = &mut self.transport {
            if let Some(host) = env.get("HOSTNAME") {
                *hostname = host.clone();
            }
            if let Some(p) = env.get("PORT").and_then(|v| v.parse().ok()) {
                *port = p;
            }
        }
        if let Some(ms) = env.get("GRACEFUL_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.graceful_shutdown_timeout = Duration::from_millis(ms);
        }
        self
    }
}
