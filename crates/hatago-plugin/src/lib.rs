pub mod capability;
pub mod host;
pub mod manifest;

pub use capability::{
    Capability, CapabilityBundle, CapabilityError, PluginCrypto, PluginFetch, PluginLogger, PluginTimer,
    RuntimeAvailability,
};
pub use host::{PluginContext, PluginError, PluginHost, PluginResult, ToolHandler};
pub use manifest::{EntryPoints, Engines, ManifestError, PluginManifest, RawManifest};
