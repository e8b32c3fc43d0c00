//! Gateway orchestrator (C9): startup sequencing and graceful shutdown
//! (§4.9) tying every component together.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use parking_lot::Mutex;
use secrecy::SecretString;
use thiserror::Error;
use tokio::net::TcpListener;

use hatago_plugin::{PluginHost, RuntimeAvailability};
use hatago_proxy::{NamespaceConfig, ProxyError, UpstreamAuth, UpstreamAuthDebugFree, UpstreamChannel, UpstreamClient, UpstreamConfig, UpstreamRegistry};
use hatago_transport::http::event_store::EventStore;
use hatago_transport::{HttpSessionTransport, HttpTransportConfig, SessionManager, SubprocessEvent, TransportError};

use crate::config::{GatewayConfig, NamespaceSettings, TransportConfig, UpstreamAuthConfig, UpstreamServerConfig};
use crate::handler::GatewayHandler;
use crate::health::{self, HealthState};
use crate::subprocess_channel::{SubprocessChannel, subprocess_config};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

fn to_upstream_auth(auth: &UpstreamAuthConfig) -> UpstreamAuthDebugFree {
    let auth = match auth {
        UpstreamAuthConfig::Bearer { token } => UpstreamAuth::Bearer(SecretString::from(token.clone())),
        UpstreamAuthConfig::Basic { username, password } => UpstreamAuth::Basic {
            username: username.clone(),
            password: SecretString::from(password.clone()),
        },
        UpstreamAuthConfig::Custom { headers } => {
            UpstreamAuth::Custom(headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        }
    };
    UpstreamAuthDebugFree(auth)
}

fn namespace_config(server_id: &str, settings: &NamespaceSettings) -> NamespaceConfig {
    NamespaceConfig {
        server_id: server_id.to_string(),
        namespace: settings.namespace.clone(),
        include: settings.include.clone(),
        exclude: settings.exclude.clone(),
        rename: settings.rename.clone(),
        separator: settings.separator.clone(),
        max_length: settings.max_length,
        strategy: settings.strategy.into(),
    }
}

/// Deregister a subprocess upstream the moment its supervisor gives up
/// restarting it, so a permanently dead upstream stops being offered by
/// `tools/list` instead of lingering as a silent dead end (§8 scenario 6).
fn spawn_restart_limit_watcher(id: String, channel: Arc<SubprocessChannel>, registry: Arc<UpstreamRegistry>) {
    let mut events = channel.supervisor().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SubprocessEvent::RestartLimitReached { max_restarts } = event {
                tracing::warn!(upstream = %id, max_restarts, "restart limit reached, deregistering upstream");
                registry.deregister_upstream(&id);
                break;
            }
        }
    });
}

/// A fully constructed gateway: its session manager, plugin host, upstream
/// registry, and (for the HTTP transport) a bound axum app, ready to serve.
pub struct Gateway {
    config: GatewayConfig,
    sessions: Arc<SessionManager<HttpSessionTransport>>,
    events: Arc<EventStore>,
    registry: Arc<UpstreamRegistry>,
    plugins: Arc<PluginHost<HttpSessionTransport>>,
    health: Arc<HealthState>,
    subprocess_channels: Mutex<Vec<Arc<SubprocessChannel>>>,
}

impl Gateway {
    /// Construct every component and enumerate every configured upstream's
    /// tools, but do not yet bind a listener (§4.9 startup, steps 1-4).
    pub async fn build(config: GatewayConfig) -> Result<Self, GatewayError> {
        let sessions = SessionManager::new(config.session.clone().into());
        sessions.spawn_sweeper();

        let replay_buffer_size = match &config.transport {
            TransportConfig::Http { replay_buffer_size, .. } => *replay_buffer_size,
            TransportConfig::Stdio { .. } => 1000,
        };
        let events = Arc::new(EventStore::new(replay_buffer_size));

        let registry = Arc::new(UpstreamRegistry::new(config.collision_policy.clone().into()));
        let plugins = Arc::new(PluginHost::new(
            Arc::clone(&sessions),
            Arc::clone(&registry),
            RuntimeAvailability::default(),
        ));

        let mut subprocess_channels = Vec::new();

        for upstream in &config.upstreams {
            match upstream {
                UpstreamServerConfig::Http {
                    id,
                    endpoint,
                    auth,
                    timeout,
                    namespace,
                } => {
                    let client_config = UpstreamConfig {
                        id: id.clone(),
                        endpoint: endpoint.clone(),
                        auth: auth.as_ref().map(to_upstream_auth),
                        timeout: *timeout,
                    };
                    match UpstreamClient::new(client_config) {
                        Ok(client) => {
                            let channel: Arc<dyn UpstreamChannel> = Arc::new(client);
                            registry.register_upstream(channel, namespace_config(id, namespace));
                        }
                        Err(err) => {
                            tracing::warn!(upstream = %id, error = %err, "failed to construct upstream client");
                            continue;
                        }
                    }
                }
                UpstreamServerConfig::Subprocess {
                    id,
                    command,
                    args,
                    working_directory,
                    environment,
                    graceful_timeout,
                    restart_on_failure,
                    max_restarts,
                    namespace,
                } => {
                    let process_config = subprocess_config(
                        id,
                        command.clone(),
                        args.clone(),
                        working_directory.clone(),
                        environment.clone(),
                        *graceful_timeout,
                        *restart_on_failure,
                        *max_restarts,
                    );
                    match SubprocessChannel::start(id.clone(), process_config).await {
                        Ok(channel) => {
                            spawn_restart_limit_watcher(id.clone(), Arc::clone(&channel), Arc::clone(&registry));
                            subprocess_channels.push(Arc::clone(&channel));
                            registry.register_upstream(channel, namespace_config(id, namespace));
                        }
                        Err(err) => {
                            tracing::warn!(upstream = %id, error = %err, "failed to spawn subprocess upstream");
                            continue;
                        }
                    }
                }
            }
        }

        // Enumeration failures are logged and skipped per upstream (§4.8
        // failure semantics): one bad upstream never blocks the others.
        for (id, result) in registry.enumerate_all().await {
            if let Err(err) = result {
                tracing::warn!(upstream = %id, error = %err, "tool enumeration failed");
            }
        }

        Ok(Self {
            config,
            sessions,
            events,
            registry,
            plugins,
            health: HealthState::new(),
            subprocess_channels: Mutex::new(subprocess_channels),
        })
    }

    pub fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    pub fn plugins(&self) -> &Arc<PluginHost<HttpSessionTransport>> {
        &self.plugins
    }

    /// Build the full axum app: the MCP endpoint plus health/drain routes
    /// (§4.9 "expose the MCP endpoint via C7; register health endpoints").
    /// Only meaningful for the HTTP transport; callers on stdio should use
    /// [`Gateway::serve_stdio`] instead.
    pub fn http_app(&self) -> Result<Router, GatewayError> {
        let TransportConfig::Http {
            endpoint_path,
            keep_alive,
            max_message_size,
            max_queue_size,
            replay_buffer_size,
            dns_guard,
            ..
        } = &self.config.transport
        else {
            return Err(GatewayError::InvalidConfig {
                message: "http_app requires an http transport config".to_string(),
            });
        };

        let transport_config = HttpTransportConfig {
            endpoint_path: endpoint_path.clone(),
            keep_alive: *keep_alive,
            max_message_size: *max_message_size,
            max_queue_size: *max_queue_size,
            replay_buffer_size: *replay_buffer_size,
            dns_guard: dns_guard.clone().into(),
        };

        let handler = Arc::new(GatewayHandler::new(
            self.config.server_name.clone(),
            self.config.server_version.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.plugins),
        ));

        let mcp_router = hatago_transport::http::router(
            transport_config,
            Arc::clone(&self.sessions),
            Arc::clone(&self.events),
            handler,
        );

        self.health.mark_ready();
        Ok(mcp_router.merge(health::router(Arc::clone(&self.health))))
    }

    /// Bind and serve the HTTP transport until the cancellation-bearing
    /// shutdown future resolves, then drain for at most
    /// `graceful_shutdown_timeout` (§4.9) before tearing down.
    pub async fn serve_http(&self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<(), GatewayError> {
        let TransportConfig::Http { hostname, port, .. } = &self.config.transport else {
            return Err(GatewayError::InvalidConfig {
                message: "serve_http requires an http transport config".to_string(),
            });
        };
        let addr: SocketAddr = format!("{hostname}:{port}")
            .parse()
            .map_err(|_| GatewayError::InvalidConfig {
                message: format!("invalid bind address {hostname}:{port}"),
            })?;

        let app = self.http_app()?;
        let listener = TcpListener::bind(addr).await.map_err(|source| GatewayError::Bind { addr, source })?;
        let health = Arc::clone(&self.health);
        let serving = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                shutdown.await;
                health.mark_draining();
            });

        match tokio::time::timeout(self.config.graceful_shutdown_timeout, serving).await {
            Ok(result) => result.map_err(|source| GatewayError::Bind { addr, source })?,
            Err(_) => {
                tracing::warn!("graceful shutdown timed out, forcing teardown");
            }
        }
        self.teardown().await;
        Ok(())
    }

    /// Serve the stdio transport (§9 one-session degenerate case) to
    /// completion: a single fixed session reading JSON-RPC frames from
    /// `stdin` and writing responses to `stdout` until `stdin` closes.
    pub async fn serve_stdio(&self) -> Result<(), GatewayError> {
        let TransportConfig::Stdio { max_message_size } = &self.config.transport else {
            return Err(GatewayError::InvalidConfig {
                message: "serve_stdio requires a stdio transport config".to_string(),
            });
        };

        let handler = Arc::new(GatewayHandler::new(
            self.config.server_name.clone(),
            self.config.server_version.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.plugins),
        ));
        let session_id = hatago_core::SessionId::generate();
        let config = hatago_transport::stdio::StdioTransportConfig {
            max_message_size: *max_message_size,
        };

        self.health.mark_ready();
        let result = hatago_transport::stdio::serve(config, handler, session_id, tokio::io::stdin(), tokio::io::stdout()).await;
        self.shutdown().await;
        result.map_err(GatewayError::Transport)
    }

    /// Stop every spawned subprocess upstream and destroy all sessions.
    /// Idempotent; safe to call even if nothing was ever spawned.
    pub async fn teardown(&self) {
        let channels = self.subprocess_channels.lock().clone();
        for channel in channels {
            channel.stop().await;
        }
        self.sessions.destroy();
    }

    /// Mark the gateway draining and tear everything down (§4.9). Use this
    /// directly for stdio or any caller not going through [`Self::serve_http`].
    pub async fn shutdown(&self) {
        self.health.mark_draining();
        self.teardown().await;
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }
}

/// Whether the gateway is currently accepting new sessions.
pub fn is_accepting_sessions(health: &HealthState) -> bool {
    !health.is_draining()
}
