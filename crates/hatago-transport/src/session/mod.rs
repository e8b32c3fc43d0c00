//! Session manager (C6): atomic lifecycle of `{id, transport, per-plugin
//! data, timestamps}` with TTL, capped capacity, ID rotation, and cleanup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use hatago_core::SessionId;

use crate::error::{TransportError, TransportResult};

/// Anything a session owns that needs best-effort teardown on rotation or
/// expiry. The HTTP and stdio transports implement this over their own
/// per-session stream handles.
pub trait SessionTransport: Send + Sync + std::fmt::Debug {
    fn close(&self);
}

/// `{ id, transport, data, createdAt, lastAccessedAt, expiresAt }` (§3).
/// Owned exclusively by the [`SessionManager`]; no clone escapes deletion.
pub struct SessionRecord<T: SessionTransport> {
    pub id: SessionId,
    pub transport: Arc<T>,
    pub data: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T: SessionTransport> SessionRecord<T> {
    fn new(id: SessionId, transport: Arc<T>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id,
            transport,
            data: HashMap::new(),
            created_at: now,
            last_accessed_at: now,
            expires_at: now + chrono_duration(ttl),
        }
    }

    fn touch(&mut self, ttl: Duration) {
        self.last_accessed_at = Utc::now();
        self.expires_at = self.last_accessed_at + chrono_duration(ttl);
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).expect("TTL duration out of chrono's representable range")
}

/// Builds the `"plugin:<pluginId>:<userKey>"` namespacing key (§3).
pub fn plugin_data_key(plugin_id: &str, user_key: &str) -> String {
    format!("plugin:{plugin_id}:{user_key}")
}

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub max_sessions: usize,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            ttl: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

struct Inner<T: SessionTransport> {
    sessions: HashMap<String, SessionRecord<T>>,
    destroyed: bool,
}

/// Owns `mapping sessionId → SessionRecord`. All mutating operations take the
/// same internal lock, which is what makes `rotate` atomic: the first caller
/// to observe `oldId` still present under the lock wins; every later caller
/// finds it already gone and receives [`TransportError::RotationLost`].
pub struct SessionManager<T: SessionTransport> {
    config: SessionManagerConfig,
    inner: Mutex<Inner<T>>,
}

impl<T: SessionTransport> SessionManager<T> {
    pub fn new(config: SessionManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                destroyed: false,
            }),
        })
    }

    /// Spawn the background sweep task. Call once per manager instance.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if manager.sweep_once() {
                    break;
                }
            }
        })
    }

    /// Removes expired records; returns `true` once the manager has been destroyed.
    fn sweep_once(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return true;
        }
        let now = Utc::now();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, record| !record.is_expired(now));
        let removed = before - inner.sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "session sweep removed expired records");
        }
        false
    }

    /// Create a new session, evicting the LRU record first if at capacity.
    pub fn create(&self, transport: Arc<T>) -> TransportResult<SessionId> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(TransportError::SessionNotFound);
        }
        if self.config.max_sessions == 0 {
            return Err(TransportError::CapacityExceeded);
        }
        if inner.sessions.len() >= self.config.max_sessions {
            let lru_key = inner
                .sessions
                .iter()
                .min_by_key(|(_, record)| record.last_accessed_at)
                .map(|(key, _)| key.clone());
            match lru_key {
                Some(key) => {
                    if let Some(evicted) = inner.sessions.remove(&key) {
                        evicted.transport.close();
                    }
                }
                None => return Err(TransportError::CapacityExceeded),
            }
        }
        let id = SessionId::generate();
        let record = SessionRecord::new(id.clone(), transport, self.config.ttl);
        inner.sessions.insert(id.to_string(), record);
        Ok(id)
    }

    /// Touch a session, extending its TTL, and return a snapshot of its plugin data.
    pub fn access(&self, id: &SessionId) -> TransportResult<HashMap<String, serde_json::Value>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let record = inner
            .sessions
            .get_mut(id.as_str())
            .filter(|record| !record.is_expired(now))
            .ok_or(TransportError::SessionNotFound)?;
        record.touch(self.config.ttl);
        Ok(record.data.clone())
    }

    /// Atomically replace `old_id` with a freshly minted id, preserving
    /// `createdAt` and plugin data, refreshing the TTL, and best-effort
    /// closing the old transport. Exactly one concurrent caller for a given
    /// `old_id` observes `Ok`; the rest observe `RotationLost`.
    pub fn rotate(&self, old_id: &SessionId) -> TransportResult<SessionId> {
        let mut inner = self.inner.lock();
        let mut old_record = inner
            .sessions
            .remove(old_id.as_str())
            .ok_or(TransportError::RotationLost)?;

        old_record.transport.close();

        let new_id = SessionId::generate();
        let now = Utc::now();
        let new_record = SessionRecord {
            id: new_id.clone(),
            transport: old_record.transport,
            data: old_record.data,
            created_at: old_record.created_at,
            last_accessed_at: now,
            expires_at: now + chrono_duration(self.config.ttl),
        };
        inner.sessions.insert(new_id.to_string(), new_record);
        Ok(new_id)
    }

    pub fn set_plugin_data(
        &self,
        id: &SessionId,
        key: &str,
        value: serde_json::Value,
    ) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .sessions
            .get_mut(id.as_str())
            .ok_or(TransportError::SessionNotFound)?;
        record.data.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get_plugin_data(
        &self,
        id: &SessionId,
        key: &str,
    ) -> TransportResult<Option<serde_json::Value>> {
        let inner = self.inner.lock();
        let record = inner
            .sessions
            .get(id.as_str())
            .ok_or(TransportError::SessionNotFound)?;
        Ok(record.data.get(key).cloned())
    }

    pub fn delete_plugin_data(&self, id: &SessionId, key: &str) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .sessions
            .get_mut(id.as_str())
            .ok_or(TransportError::SessionNotFound)?;
        record.data.remove(key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy exactly one session; a no-op if it is already gone.
    pub fn destroy_one(&self, id: &SessionId) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.sessions.remove(id.as_str()) {
            record.transport.close();
        }
    }

    /// Idempotent teardown: further operations deterministically return "not found".
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return;
        }
        for (_, record) in inner.sessions.drain() {
            record.transport.close();
        }
        inner.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NoopTransport;
    impl SessionTransport for NoopTransport {
        fn close(&self) {}
    }

    fn manager(max_sessions: usize) -> Arc<SessionManager<NoopTransport>> {
        SessionManager::new(SessionManagerConfig {
            max_sessions,
            ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
        })
    }

    #[test]
    fn created_at_never_exceeds_last_accessed_or_expires() {
        let manager = manager(10);
        let id = manager.create(Arc::new(NoopTransport)).unwrap();
        manager.access(&id).unwrap();
        let inner = manager.inner.lock();
        let record = &inner.sessions[id.as_str()];
        assert!(record.created_at <= record.last_accessed_at);
        assert!(record.last_accessed_at <= record.expires_at);
    }

    #[test]
    fn max_sessions_zero_rejects_all_creations() {
        let manager = manager(0);
        let result = manager.create(Arc::new(NoopTransport));
        assert!(matches!(result, Err(TransportError::CapacityExceeded)));
    }

    #[test]
    fn creation_at_capacity_evicts_exactly_one_lru_record() {
        let manager = manager(1);
        let first = manager.create(Arc::new(NoopTransport)).unwrap();
        let second = manager.create(Arc::new(NoopTransport)).unwrap();
        assert_eq!(manager.len(), 1);
        assert!(manager.access(&first).is_err());
        assert!(manager.access(&second).is_ok());
    }

    #[test]
    fn rotate_moves_plugin_data_and_removes_old_id() {
        let manager = manager(10);
        let old_id = manager.create(Arc::new(NoopTransport)).unwrap();
        manager
            .set_plugin_data(&old_id, "plugin:p:k", serde_json::json!("v"))
            .unwrap();

        let new_id = manager.rotate(&old_id).unwrap();

        assert!(manager.access(&old_id).is_err());
        assert_eq!(
            manager.get_plugin_data(&new_id, "plugin:p:k").unwrap(),
            Some(serde_json::json!("v"))
        );
    }

    #[test]
    fn second_rotate_of_same_old_id_is_rotation_lost() {
        let manager = manager(10);
        let old_id = manager.create(Arc::new(NoopTransport)).unwrap();
        manager.rotate(&old_id).unwrap();
        let result = manager.rotate(&old_id);
        assert!(matches!(result, Err(TransportError::RotationLost)));
    }

    #[test]
    fn plugin_data_round_trips_and_deletes() {
        let manager = manager(10);
        let id = manager.create(Arc::new(NoopTransport)).unwrap();
        let key = plugin_data_key("demo", "count");
        manager
            .set_plugin_data(&id, &key, serde_json::json!(1))
            .unwrap();
        assert_eq!(
            manager.get_plugin_data(&id, &key).unwrap(),
            Some(serde_json::json!(1))
        );
        manager.delete_plugin_data(&id, &key).unwrap();
        assert_eq!(manager.get_plugin_data(&id, &key).unwrap(), None);
    }

    #[test]
    fn destroy_one_removes_only_the_named_session() {
        let manager = manager(10);
        let a = manager.create(Arc::new(NoopTransport)).unwrap();
        let b = manager.create(Arc::new(NoopTransport)).unwrap();
        manager.destroy_one(&a);
        assert!(manager.access(&a).is_err());
        assert!(manager.access(&b).is_ok());
    }

    #[test]
    fn destroy_is_idempotent_and_invalidates_sessions() {
        let manager = manager(10);
        let id = manager.create(Arc::new(NoopTransport)).unwrap();
        manager.destroy();
        manager.destroy();
        assert!(manager.access(&id).is_err());
    }
}
