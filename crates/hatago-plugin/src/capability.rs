//! Capability registry (C2): a plugin manifest lists capabilities it wants;
//! the bundle handed to the running instance exposes exactly those and no
//! others (§4.2).

use std::sync::Arc;

use thiserror::Error;

/// The fixed universe of capabilities a plugin manifest can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Logger,
    Fetch,
    Kv,
    Timer,
    Crypto,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Self::Logger => "logger",
            Self::Fetch => "fetch",
            Self::Kv => "kv",
            Self::Timer => "timer",
            Self::Crypto => "crypto",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "logger" => Some(Self::Logger),
            "fetch" => Some(Self::Fetch),
            "kv" => Some(Self::Kv),
            "timer" => Some(Self::Timer),
            "crypto" => Some(Self::Crypto),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CapabilityError {
    #[error("unknown capability: {name}")]
    Unknown { name: String },
    #[error("unavailable capability: {name}")]
    Unavailable { name: String },
    #[error("capability '{name}' was not granted to plugin '{plugin_id}'")]
    NotGranted { plugin_id: String, name: String },
}

/// What the hosting runtime can actually back a capability with. A runtime
/// with no scheduler (e.g. a one-shot CLI invocation) sets `timer: false`.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeAvailability {
    pub timer: bool,
}

impl Default for RuntimeAvailability {
    fn default() -> Self {
        Self { timer: true }
    }
}

impl RuntimeAvailability {
    fn provides(self, capability: Capability) -> bool {
        match capability {
            Capability::Logger | Capability::Fetch | Capability::Kv | Capability::Crypto => true,
            Capability::Timer => self.timer,
        }
    }
}

/// Tags every capability invocation with the owning plugin id, for audit
/// logging at the call site rather than inside the capability itself.
#[derive(Debug, Clone)]
pub struct CapabilityBundle {
    plugin_id: String,
    granted: Vec<Capability>,
}

impl CapabilityBundle {
    /// Resolve `requested` against `availability`. `logger` is implicitly
    /// granted even if absent from `requested` (§4.2). Fails closed: the
    /// first unavailable or unknown capability aborts the whole bundle,
    /// matching "fails plugin load with an unambiguous error".
    pub fn resolve(
        plugin_id: impl Into<String>,
        requested: &[String],
        availability: RuntimeAvailability,
    ) -> Result<Self, CapabilityError> {
        let mut granted = vec![Capability::Logger];
        for name in requested {
            let capability = Capability::parse(name).ok_or_else(|| CapabilityError::Unknown { name: name.clone() })?;
            if !availability.provides(capability) {
                return Err(CapabilityError::Unavailable { name: name.clone() });
            }
            if !granted.contains(&capability) {
                granted.push(capability);
            }
        }
        Ok(Self {
            plugin_id: plugin_id.into(),
            granted,
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }

    pub fn granted(&self) -> &[Capability] {
        &self.granted
    }

    /// A logger handle tagged with the plugin id; `None` if somehow not
    /// granted (never happens in practice since logger is always included).
    pub fn logger(self: &Arc<Self>) -> Option<PluginLogger> {
        self.has(Capability::Logger).then(|| PluginLogger {
            plugin_id: self.plugin_id.clone(),
        })
    }

    /// Require `capability`, returning a [`CapabilityError::NotGranted`] when
    /// the manifest never requested it (§4.2 "exposes exactly those
    /// capabilities and no others").
    pub fn require(&self, capability: Capability) -> Result<(), CapabilityError> {
        if self.has(capability) {
            Ok(())
        } else {
            Err(CapabilityError::NotGranted {
                plugin_id: self.plugin_id.clone(),
                name: capability.name().to_string(),
            })
        }
    }

    /// An outbound-HTTP handle, gated on [`Capability::Fetch`].
    pub fn fetch(self: &Arc<Self>) -> Option<PluginFetch> {
        self.has(Capability::Fetch).then(|| PluginFetch {
            plugin_id: self.plugin_id.clone(),
            client: reqwest::Client::new(),
        })
    }

    /// A sleep-only timer handle, gated on [`Capability::Timer`].
    pub fn timer(self: &Arc<Self>) -> Option<PluginTimer> {
        self.has(Capability::Timer).then_some(PluginTimer)
    }

    /// A hashing/randomness handle, gated on [`Capability::Crypto`].
    pub fn crypto(self: &Arc<Self>) -> Option<PluginCrypto> {
        self.has(Capability::Crypto).then_some(PluginCrypto)
    }
}

/// A capability handle that tags its own emissions with the plugin id for
/// audit (§4.2 "tags outbound side effects with the plugin id").
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: String,
}

impl PluginLogger {
    pub fn info(&self, message: &str) {
        tracing::info!(plugin_id = %self.plugin_id, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(plugin_id = %self.plugin_id, "{message}");
    }
}

/// Outbound HTTP for a plugin holding [`Capability::Fetch`]. Every request
/// goes through one shared `reqwest::Client`; there is no allowlist here,
/// the capability grant itself is the boundary.
#[derive(Debug, Clone)]
pub struct PluginFetch {
    plugin_id: String,
    client: reqwest::Client,
}

impl PluginFetch {
    pub async fn get(&self, url: &str) -> Result<String, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| format!("fetch failed for plugin '{}': {err}", self.plugin_id))?;
        response
            .text()
            .await
            .map_err(|err| format!("fetch body read failed for plugin '{}': {err}", self.plugin_id))
    }
}

/// Scheduling for a plugin holding [`Capability::Timer`]. Availability is
/// already checked once at bundle resolution (`RuntimeAvailability::timer`);
/// this handle is just the delivery mechanism.
#[derive(Debug, Clone, Copy)]
pub struct PluginTimer;

impl PluginTimer {
    pub async fn sleep(&self, duration: std::time::Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Hashing and randomness for a plugin holding [`Capability::Crypto`].
#[derive(Debug, Clone, Copy)]
pub struct PluginCrypto;

impl PluginCrypto {
    pub fn sha256(&self, data: &[u8]) -> [u8; 32] {
        let digest = ring::digest::digest(&ring::digest::SHA256, data);
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_ref());
        out
    }

    pub fn random_bytes(&self, len: usize) -> Result<Vec<u8>, String> {
        use ring::rand::SecureRandom;
        let mut bytes = vec![0u8; len];
        ring::rand::SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| "random byte generation failed".to_string())?;
        Ok(bytes)
    }
}
