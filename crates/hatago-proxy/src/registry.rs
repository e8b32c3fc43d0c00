//! Upstream registry: the N-upstream generalization of a single backend
//! connector, keyed by `UpstreamServerConfig.id`. Owns the namespace mapping
//! table and dispatches `tools/call` to the mapped upstream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use hatago_protocol::JsonRpcResponsePayload;

use crate::error::{ProxyError, ProxyResult};
use crate::namespace::{CollisionPolicy, NamespaceConfig, NamespaceManager, NamespaceStats, ToolMapping};
use crate::upstream::{UpstreamClient, UpstreamReply};

/// What the registry needs from one upstream connection, whether it is
/// backed by HTTP ([`UpstreamClient`]) or a subprocess's stdio (supplied by
/// the gateway, which owns the process supervisor).
#[async_trait]
pub trait UpstreamChannel: Send + Sync {
    async fn call_raw(&self, method: &str, params: Option<Value>) -> ProxyResult<UpstreamReply>;
    async fn list_tool_names(&self) -> ProxyResult<Vec<String>>;
}

/// Extract tool names from a `tools/list` reply's payload. Shared by every
/// [`UpstreamChannel`] implementation so the `{"tools": [{"name": ...}]}`
/// shape is parsed in exactly one place.
pub fn tool_names_from_list_result(payload: JsonRpcResponsePayload) -> ProxyResult<Vec<String>> {
    match payload {
        JsonRpcResponsePayload::Success { result } => Ok(result
            .get("tools")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|tool| tool.get("name").and_then(Value::as_str).map(String::from))
            .collect()),
        JsonRpcResponsePayload::Error { error } => Err(ProxyError::Backend {
            id: "tools/list".to_string(),
            message: error.message,
        }),
    }
}

#[async_trait]
impl UpstreamChannel for UpstreamClient {
    async fn call_raw(&self, method: &str, params: Option<Value>) -> ProxyResult<UpstreamReply> {
        self.call(method, params).await
    }

    async fn list_tool_names(&self) -> ProxyResult<Vec<String>> {
        let reply = self.call("tools/list", None).await?;
        tool_names_from_list_result(reply.payload)
    }
}

struct Upstream {
    channel: Arc<dyn UpstreamChannel>,
    namespace_config: NamespaceConfig,
}

/// Registered upstreams plus the single shared namespace manager. Enumeration
/// order across upstreams follows registration order (§4.3): callers should
/// register upstreams in configuration order and enumerate in that same
/// order to get the spec's deterministic collision behavior.
pub struct UpstreamRegistry {
    upstreams: RwLock<HashMap<String, Upstream>>,
    order: RwLock<Vec<String>>,
    namespaces: RwLock<NamespaceManager>,
}

impl UpstreamRegistry {
    pub fn new(collision_policy: CollisionPolicy) -> Self {
        Self {
            upstreams: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            namespaces: RwLock::new(NamespaceManager::new(collision_policy)),
        }
    }

    pub fn register_upstream(
        &self,
        channel: Arc<dyn UpstreamChannel>,
        namespace_config: NamespaceConfig,
    ) {
        let id = namespace_config.server_id.clone();
        let mut upstreams = self.upstreams.write();
        if !upstreams.contains_key(&id) {
            self.order.write().push(id.clone());
        }
        upstreams.insert(
            id,
            Upstream {
                channel,
                namespace_config,
            },
        );
    }

    pub fn deregister_upstream(&self, id: &str) {
        self.upstreams.write().remove(id);
        self.order.write().retain(|existing| existing != id);
    }

    /// Commit a fetched tool catalog to the namespace manager. Always runs
    /// under the namespace manager's single write lock, in caller order —
    /// collision resolution (§4.3) depends on registrations happening in a
    /// fixed order even when the catalogs feeding them were fetched
    /// concurrently.
    fn register_tools(&self, id: &str, namespace_config: &NamespaceConfig, tool_names: Vec<String>) -> Vec<ToolMapping> {
        let mut manager = self.namespaces.write();
        let mut mappings = Vec::new();
        for name in tool_names {
            match manager.register(namespace_config, &name) {
                Ok(mapping) => mappings.push(mapping),
                Err(err) => tracing::warn!(upstream = id, tool = %name, error = %err, "tool mapping rejected"),
            }
        }
        mappings
    }

    /// Enumerate one upstream's tool catalog and register every surviving
    /// mapping. Tools rejected by the filter/collision steps are logged and
    /// skipped rather than aborting the whole enumeration.
    pub async fn enumerate(&self, id: &str) -> ProxyResult<Vec<ToolMapping>> {
        let (channel, namespace_config) = {
            let upstreams = self.upstreams.read();
            let upstream = upstreams.get(id).ok_or_else(|| ProxyError::UnknownUpstream { id: id.to_string() })?;
            (Arc::clone(&upstream.channel), upstream.namespace_config.clone())
        };

        let tool_names = channel.list_tool_names().await?;
        Ok(self.register_tools(id, &namespace_config, tool_names))
    }

    /// Enumerate every registered upstream. The network round-trip to each
    /// upstream's `tools/list` runs concurrently (one slow upstream no
    /// longer holds up every other upstream's startup latency); the
    /// resulting catalogs are then committed to the namespace manager
    /// sequentially, in registration order (§4.3), so collision resolution
    /// stays deterministic regardless of which upstream answered first.
    pub async fn enumerate_all(&self) -> Vec<(String, ProxyResult<Vec<ToolMapping>>)> {
        let order = self.order.read().clone();
        let snapshot: Vec<(String, Arc<dyn UpstreamChannel>, NamespaceConfig)> = {
            let upstreams = self.upstreams.read();
            order
                .into_iter()
                .filter_map(|id| {
                    upstreams
                        .get(&id)
                        .map(|upstream| (id, Arc::clone(&upstream.channel), upstream.namespace_config.clone()))
                })
                .collect()
        };

        let fetches = snapshot.iter().map(|(id, channel, _)| {
            let id = id.clone();
            let channel = Arc::clone(channel);
            async move { (id, channel.list_tool_names().await) }
        });
        let fetched = futures::future::join_all(fetches).await;

        let configs: HashMap<String, NamespaceConfig> =
            snapshot.into_iter().map(|(id, _, config)| (id, config)).collect();

        fetched
            .into_iter()
            .map(|(id, tool_names)| {
                let result = tool_names.map(|tool_names| {
                    let namespace_config = configs
                        .get(&id)
                        .expect("every fetched id was read from the same snapshot");
                    self.register_tools(&id, namespace_config, tool_names)
                });
                (id, result)
            })
            .collect()
    }

    /// Resolve `public_name` to its upstream and forward the call.
    pub async fn call_tool(&self, public_name: &str, arguments: Option<Value>) -> ProxyResult<UpstreamReply> {
        let (server_id, remote_name) = {
            let manager = self.namespaces.read();
            let mapping = manager
                .mapping(public_name)
                .ok_or_else(|| ProxyError::UnknownUpstream { id: public_name.to_string() })?;
            (mapping.server_id.clone(), mapping.remote_name.clone())
        };
        let channel = {
            let upstreams = self.upstreams.read();
            let upstream = upstreams
                .get(&server_id)
                .ok_or_else(|| ProxyError::UnknownUpstream { id: server_id.clone() })?;
            Arc::clone(&upstream.channel)
        };
        let params = serde_json::json!({ "name": remote_name, "arguments": arguments });
        channel.call_raw("tools/call", Some(params)).await
    }

    /// The union of locally-mapped tools across all upstreams, for `tools/list`.
    pub fn all_mappings(&self) -> Vec<ToolMapping> {
        self.namespaces.read().mappings().cloned().collect()
    }

    pub fn namespace_stats(&self) -> NamespaceStats {
        self.namespaces.read().stats().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceStrategy;
    use tokio::sync::Mutex;

    struct FakeChannel {
        tools: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UpstreamChannel for FakeChannel {
        async fn call_raw(&self, method: &str, _params: Option<Value>) -> ProxyResult<UpstreamReply> {
            self.calls.lock().await.push(method.to_string());
            Ok(UpstreamReply {
                payload: JsonRpcResponsePayload::Success {
                    result: serde_json::json!({"ok": true}),
                },
                progress: Vec::new(),
            })
        }

        async fn list_tool_names(&self) -> ProxyResult<Vec<String>> {
            Ok(self.tools.clone())
        }
    }

    fn namespace_config(server_id: &str) -> NamespaceConfig {
        NamespaceConfig {
            server_id: server_id.to_string(),
            strategy: NamespaceStrategy::Prefix,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn enumerate_registers_every_tool_under_its_namespace() {
        let registry = UpstreamRegistry::new(CollisionPolicy::Error);
        let channel = Arc::new(FakeChannel {
            tools: vec!["search".into(), "fetch".into()],
            calls: Mutex::new(Vec::new()),
        });
        registry.register_upstream(channel, namespace_config("srv1"));

        let mappings = registry.enumerate("srv1").await.unwrap();
        assert_eq!(mappings.len(), 2);
        assert!(registry.all_mappings().iter().any(|m| m.public_name == "srv1:search"));
    }

    #[tokio::test]
    async fn call_tool_forwards_to_the_mapped_upstream_with_remote_name() {
        let registry = UpstreamRegistry::new(CollisionPolicy::Error);
        let channel = Arc::new(FakeChannel {
            tools: vec!["search".into()],
            calls: Mutex::new(Vec::new()),
        });
        registry.register_upstream(channel, namespace_config("srv1"));
        registry.enumerate("srv1").await.unwrap();

        let reply = registry.call_tool("srv1:search", Some(serde_json::json!({"q": "x"}))).await.unwrap();
        assert!(matches!(reply.payload, JsonRpcResponsePayload::Success { .. }));
    }

    #[tokio::test]
    async fn call_tool_with_unknown_name_errors() {
        let registry = UpstreamRegistry::new(CollisionPolicy::Error);
        let result = registry.call_tool("nope", None).await;
        assert!(matches!(result, Err(ProxyError::UnknownUpstream { .. })));
    }

    #[tokio::test]
    async fn enumerate_all_commits_collisions_in_registration_order() {
        let registry = UpstreamRegistry::new(CollisionPolicy::Rename { prefix_format: None });
        registry.register_upstream(
            Arc::new(FakeChannel {
                tools: vec!["search".into()],
                calls: Mutex::new(Vec::new()),
            }),
            NamespaceConfig {
                namespace: Some("shared".to_string()),
                ..namespace_config("srv1")
            },
        );
        registry.register_upstream(
            Arc::new(FakeChannel {
                tools: vec!["search".into()],
                calls: Mutex::new(Vec::new()),
            }),
            NamespaceConfig {
                namespace: Some("shared".to_string()),
                ..namespace_config("srv2")
            },
        );

        let results = registry.enumerate_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "srv1");
        assert_eq!(results[1].0, "srv2");
        let srv2_mappings = results[1].1.as_ref().unwrap();
        assert_eq!(srv2_mappings[0].public_name, "shared:search:2");
    }

    #[tokio::test]
    async fn deregister_removes_upstream_from_enumeration_order() {
        let registry = UpstreamRegistry::new(CollisionPolicy::Error);
        let channel = Arc::new(FakeChannel {
            tools: vec!["search".into()],
            calls: Mutex::new(Vec::new()),
        });
        registry.register_upstream(channel, namespace_config("srv1"));
        registry.deregister_upstream("srv1");
        let result = registry.enumerate("srv1").await;
        assert!(matches!(result, Err(ProxyError::UnknownUpstream { .. })));
    }
}
