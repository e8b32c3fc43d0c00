//! Plugin host / dispatcher (C8): load plugins behind the `HostState`
//! reducer, register their tools, and dispatch `tools/call` to a local
//! handler or forward it upstream (§4.8).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use hatago_core::{HostEffect, HostEvent, HostState, SessionId};
use hatago_protocol::{JsonRpcError, JsonRpcErrorCode, JsonRpcResponsePayload};
use hatago_proxy::{ProxyError, UpstreamRegistry};
use hatago_transport::error::TransportError;
use hatago_transport::session::{SessionManager, SessionTransport, plugin_data_key};

use crate::capability::{Capability, CapabilityBundle, CapabilityError, RuntimeAvailability};
use crate::manifest::{ManifestError, PluginManifest, RawManifest};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("plugin '{name}' is not running")]
    NotRunning { name: String },
    #[error("unknown plugin: {name}")]
    UnknownPlugin { name: String },
}

pub type PluginResult<T> = Result<T, PluginError>;

fn run_effects(effects: Vec<HostEffect>, plugin_name: &str) {
    for effect in effects {
        match effect {
            HostEffect::LogInfo(message) => tracing::info!(plugin = plugin_name, "{message}"),
            HostEffect::LogError(message) => tracing::error!(plugin = plugin_name, "{message}"),
            HostEffect::ActivatePlugins | HostEffect::ReleasePluginResources => {}
        }
    }
}

/// What a local tool handler sees when invoked: its capability bundle and a
/// scoped view of the calling session's plugin-namespaced data (§3, §4.6).
pub struct PluginContext<T: SessionTransport> {
    pub capabilities: Arc<CapabilityBundle>,
    sessions: Arc<SessionManager<T>>,
    plugin_id: String,
}

impl<T: SessionTransport> PluginContext<T> {
    pub fn get_data(&self, session_id: &SessionId, key: &str) -> PluginResult<Option<Value>> {
        self.capabilities.require(Capability::Kv)?;
        let full_key = plugin_data_key(&self.plugin_id, key);
        Ok(self.sessions.get_plugin_data(session_id, &full_key)?)
    }

    pub fn set_data(&self, session_id: &SessionId, key: &str, value: Value) -> PluginResult<()> {
        self.capabilities.require(Capability::Kv)?;
        let full_key = plugin_data_key(&self.plugin_id, key);
        Ok(self.sessions.set_plugin_data(session_id, &full_key, value)?)
    }

    pub fn delete_data(&self, session_id: &SessionId, key: &str) -> PluginResult<()> {
        self.capabilities.require(Capability::Kv)?;
        let full_key = plugin_data_key(&self.plugin_id, key);
        Ok(self.sessions.delete_plugin_data(session_id, &full_key)?)
    }
}

/// A plugin-registered tool handler, invoked with the calling session's id
/// and the raw JSON arguments.
#[async_trait]
pub trait ToolHandler<T: SessionTransport>: Send + Sync {
    async fn call(
        &self,
        ctx: &PluginContext<T>,
        session_id: &SessionId,
        arguments: Option<Value>,
    ) -> Result<Value, String>;
}

struct PluginInstance<T: SessionTransport> {
    manifest: PluginManifest,
    capabilities: Option<Arc<CapabilityBundle>>,
    state: Mutex<HostState>,
    tools: DashMap<String, Arc<dyn ToolHandler<T>>>,
}

/// Owns every loaded plugin instance plus the upstream registry a remote
/// `tools/call` forwards to.
pub struct PluginHost<T: SessionTransport> {
    sessions: Arc<SessionManager<T>>,
    upstreams: Arc<UpstreamRegistry>,
    plugins: DashMap<String, Arc<PluginInstance<T>>>,
    availability: RuntimeAvailability,
}

impl<T: SessionTransport + 'static> PluginHost<T> {
    pub fn new(
        sessions: Arc<SessionManager<T>>,
        upstreams: Arc<UpstreamRegistry>,
        availability: RuntimeAvailability,
    ) -> Self {
        Self {
            sessions,
            upstreams,
            plugins: DashMap::new(),
            availability,
        }
    }

    /// Validate the manifest, resolve its capability bundle, and run the
    /// `idle -> loading -> running|error` sequence (§4.8). A manifest or
    /// capability failure is fatal only for this plugin.
    pub fn load(&self, raw_manifest: RawManifest) -> PluginResult<Arc<CapabilityBundle>> {
        let manifest = PluginManifest::validate(raw_manifest)?;
        let name = manifest.name.clone();

        let mut state = HostState::Idle;
        let (next, effects) = state.reduce(HostEvent::Load);
        run_effects(effects, &name);
        state = next;

        match CapabilityBundle::resolve(&name, &manifest.capabilities, self.availability) {
            Ok(bundle) => {
                let (next, effects) = state.reduce(HostEvent::LoadSucceeded);
                run_effects(effects, &name);
                let bundle = Arc::new(bundle);
                let instance = Arc::new(PluginInstance {
                    manifest,
                    capabilities: Some(Arc::clone(&bundle)),
                    state: Mutex::new(next),
                    tools: DashMap::new(),
                });
                self.plugins.insert(name, instance);
                Ok(bundle)
            }
            Err(err) => {
                let (next, effects) = state.reduce(HostEvent::LoadFailed {
                    message: err.to_string(),
                });
                run_effects(effects, &name);
                let instance = Arc::new(PluginInstance {
                    manifest,
                    capabilities: None,
                    state: Mutex::new(next),
                    tools: DashMap::new(),
                });
                self.plugins.insert(name, instance);
                Err(err.into())
            }
        }
    }

    /// Register a tool handler for a running plugin. A plugin that failed to
    /// load cannot register tools.
    pub fn register_tool(
        &self,
        plugin_name: &str,
        tool_name: impl Into<String>,
        handler: Arc<dyn ToolHandler<T>>,
    ) -> PluginResult<()> {
        let instance = self
            .plugins
            .get(plugin_name)
            .ok_or_else(|| PluginError::UnknownPlugin {
                name: plugin_name.to_string(),
            })?;
        if *instance.state.lock() != HostState::Running {
            return Err(PluginError::NotRunning {
                name: plugin_name.to_string(),
            });
        }
        instance.tools.insert(tool_name.into(), handler);
        Ok(())
    }

    /// Stop a running (or errored) plugin and release its resources.
    pub fn stop(&self, plugin_name: &str) -> PluginResult<()> {
        let instance = self
            .plugins
            .get(plugin_name)
            .ok_or_else(|| PluginError::UnknownPlugin {
                name: plugin_name.to_string(),
            })?;
        let mut state = instance.state.lock();
        let (next, effects) = state.reduce(HostEvent::Stop);
        run_effects(effects, plugin_name);
        *state = next;
        Ok(())
    }

    /// Tool names registered by currently-running plugins, for `tools/list`.
    pub fn local_tool_names(&self) -> Vec<String> {
        self.plugins
            .iter()
            .filter(|entry| *entry.value().state.lock() == HostState::Running)
            .flat_map(|entry| entry.value().tools.iter().map(|t| t.key().clone()).collect::<Vec<_>>())
            .collect()
    }

    pub fn is_running(&self, plugin_name: &str) -> bool {
        self.plugins
            .get(plugin_name)
            .is_some_and(|instance| *instance.state.lock() == HostState::Running)
    }

    /// Dispatch a `tools/call` (§4.8): local handler first, else forward
    /// upstream. Never panics on an unknown tool; returns a proper JSON-RPC
    /// error payload instead.
    pub async fn dispatch_tool_call(
        &self,
        session_id: &SessionId,
        public_name: &str,
        arguments: Option<Value>,
    ) -> JsonRpcResponsePayload {
        for entry in self.plugins.iter() {
            let instance = Arc::clone(entry.value());
            let Some(handler) = instance.tools.get(public_name).map(|h| Arc::clone(&h)) else {
                continue;
            };
            let Some(capabilities) = instance.capabilities.clone() else {
                continue;
            };
            let ctx = PluginContext {
                capabilities,
                sessions: Arc::clone(&self.sessions),
                plugin_id: instance.manifest.name.clone(),
            };
            return match handler.call(&ctx, session_id, arguments).await {
                Ok(result) => JsonRpcResponsePayload::Success { result },
                Err(message) => JsonRpcResponsePayload::Error {
                    error: JsonRpcError {
                        code: JsonRpcErrorCode::InternalError.code(),
                        message,
                        data: None,
                    },
                },
            };
        }

        match self.upstreams.call_tool(public_name, arguments).await {
            Ok(reply) => reply.payload,
            Err(err) => JsonRpcResponsePayload::Error {
                error: JsonRpcError {
                    code: JsonRpcErrorCode::ApplicationError(-32001).code(),
                    message: err.to_string(),
                    data: None,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatago_proxy::CollisionPolicy;
    use hatago_transport::session::SessionManagerConfig;

    #[derive(Debug)]
    struct NoopTransport;
    impl SessionTransport for NoopTransport {
        fn close(&self) {}
    }

    struct EchoTool;

    #[async_trait]
    impl ToolHandler<NoopTransport> for EchoTool {
        async fn call(
            &self,
            _ctx: &PluginContext<NoopTransport>,
            _session_id: &SessionId,
            arguments: Option<Value>,
        ) -> Result<Value, String> {
            Ok(arguments.unwrap_or(Value::Null))
        }
    }

    fn host() -> PluginHost<NoopTransport> {
        let sessions = SessionManager::new(SessionManagerConfig::default());
        let upstreams = Arc::new(UpstreamRegistry::new(CollisionPolicy::Error));
        PluginHost::new(sessions, upstreams, RuntimeAvailability::default())
    }

    fn manifest(name: &str, capabilities: serde_json::Value) -> RawManifest {
        RawManifest {
            name: Some(name.to_string()),
            version: Some("1.0.0".into()),
            description: Some("test plugin".into()),
            engines: Some(crate::manifest::Engines { hatago: "^1".into() }),
            capabilities: Some(capabilities),
            entry: Some(crate::manifest::EntryPoints {
                default: "index.js".into(),
            }),
        }
    }

    #[test]
    fn load_then_register_then_stop_transitions_cleanly() {
        let host = host();
        host.load(manifest("echo", serde_json::json!(["logger"]))).unwrap();
        assert!(host.is_running("echo"));
        host.register_tool("echo", "echo:say", Arc::new(EchoTool)).unwrap();
        host.stop("echo").unwrap();
        assert!(!host.is_running("echo"));
    }

    #[test]
    fn registering_a_tool_on_an_unknown_plugin_fails() {
        let host = host();
        let result = host.register_tool("ghost", "x", Arc::new(EchoTool));
        assert!(matches!(result, Err(PluginError::UnknownPlugin { .. })));
    }

    #[test]
    fn a_plugin_that_fails_to_load_cannot_register_tools() {
        let host = host();
        let availability = RuntimeAvailability { timer: false };
        let host = PluginHost::new(
            SessionManager::new(SessionManagerConfig::default()),
            Arc::new(UpstreamRegistry::new(CollisionPolicy::Error)),
            availability,
        );
        let result = host.load(manifest("bad", serde_json::json!(["timer"])));
        assert!(result.is_err());
        assert!(!host.is_running("bad"));
        let register = host.register_tool("bad", "x", Arc::new(EchoTool));
        assert!(matches!(register, Err(PluginError::NotRunning { .. })));
    }

    #[tokio::test]
    async fn dispatch_routes_to_the_registered_local_handler() {
        let host = host();
        host.load(manifest("echo", serde_json::json!([]))).unwrap();
        host.register_tool("echo", "echo:say", Arc::new(EchoTool)).unwrap();
        let session_id = SessionId::generate();
        let payload = host
            .dispatch_tool_call(&session_id, "echo:say", Some(serde_json::json!({"x": 1})))
            .await;
        match payload {
            JsonRpcResponsePayload::Success { result } => assert_eq!(result, serde_json::json!({"x": 1})),
            JsonRpcResponsePayload::Error { .. } => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn dispatch_falls_back_to_an_upstream_error_for_an_unknown_tool() {
        let host = host();
        let session_id = SessionId::generate();
        let payload = host.dispatch_tool_call(&session_id, "nope:nope", None).await;
        assert!(matches!(payload, JsonRpcResponsePayload::Error { .. }));
    }

    #[test]
    fn plugin_data_access_requires_the_kv_capability() {
        let sessions = SessionManager::new(SessionManagerConfig::default());
        let capabilities = Arc::new(
            crate::capability::CapabilityBundle::resolve("no-kv", &[], RuntimeAvailability::default()).unwrap(),
        );
        let ctx = PluginContext {
            capabilities,
            sessions: Arc::clone(&sessions),
            plugin_id: "no-kv".to_string(),
        };
        let session_id = SessionId::generate();
        let result = ctx.get_data(&session_id, "anything");
        assert!(matches!(result, Err(PluginError::Capability(CapabilityError::NotGranted { .. }))));
    }

    #[test]
    fn plugin_data_access_succeeds_once_kv_is_granted() {
        let sessions = SessionManager::new(SessionManagerConfig::default());
        let capabilities = Arc::new(
            crate::capability::CapabilityBundle::resolve("has-kv", &["kv".to_string()], RuntimeAvailability::default())
                .unwrap(),
        );
        let ctx = PluginContext {
            capabilities,
            sessions: Arc::clone(&sessions),
            plugin_id: "has-kv".to_string(),
        };
        let session_id = sessions.create(Arc::new(NoopTransport)).unwrap();
        ctx.set_data(&session_id, "k", serde_json::json!(1)).unwrap();
        assert_eq!(ctx.get_data(&session_id, "k").unwrap(), Some(serde_json::json!(1)));
    }
}
