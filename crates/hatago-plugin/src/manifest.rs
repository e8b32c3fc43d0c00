//! Plugin manifest `{name, version, engines.hatago, capabilities[], entry}`
//! and its validation (§4.8: "each produces a specific error").

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPoints {
    pub default: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engines {
    pub hatago: String,
}

/// The raw, not-yet-validated manifest as parsed from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub engines: Option<Engines>,
    #[serde(default)]
    pub capabilities: Option<Value>,
    #[serde(default)]
    pub entry: Option<EntryPoints>,
}

/// A manifest that has passed every validation step.
#[derive(Debug, Clone)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub engines_hatago: String,
    pub capabilities: Vec<String>,
    pub entry_default: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ManifestError {
    #[error("manifest missing required field 'name'")]
    MissingName,
    #[error("manifest missing required field 'version'")]
    MissingVersion,
    #[error("manifest missing required field 'description'")]
    MissingDescription,
    #[error("manifest missing required field 'engines.hatago'")]
    MissingEngines,
    #[error("manifest field 'capabilities' must be an array")]
    CapabilitiesNotArray,
    #[error("manifest missing required field 'entry.default'")]
    MissingEntryDefault,
}

impl PluginManifest {
    /// Validate field-by-field in the order spec'd (§4.8) so the first
    /// violation, not an arbitrary one, is reported.
    pub fn validate(raw: RawManifest) -> Result<Self, ManifestError> {
        let name = raw.name.filter(|s| !s.is_empty()).ok_or(ManifestError::MissingName)?;
        let version = raw.version.filter(|s| !s.is_empty()).ok_or(ManifestError::MissingVersion)?;
        let description = raw
            .description
            .filter(|s| !s.is_empty())
            .ok_or(ManifestError::MissingDescription)?;
        let engines_hatago = raw
            .engines
            .map(|engines| engines.hatago)
            .filter(|s| !s.is_empty())
            .ok_or(ManifestError::MissingEngines)?;

        let capabilities = match raw.capabilities {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| item.as_str().map(String::from))
                .collect(),
            Some(_) => return Err(ManifestError::CapabilitiesNotArray),
        };

        let entry_default = raw
            .entry
            .map(|entry| entry.default)
            .filter(|s| !s.is_empty())
            .ok_or(ManifestError::MissingEntryDefault)?;

        Ok(Self {
            name,
            version,
            description,
            engines_hatago,
            capabilities,
            entry_default,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_raw() -> RawManifest {
        RawManifest {
            name: Some("echo".into()),
            version: Some("1.0.0".into()),
            description: Some("echoes input".into()),
            engines: Some(Engines { hatago: "^1".into() }),
            capabilities: Some(serde_json::json!(["logger", "fetch"])),
            entry: Some(EntryPoints { default: "index.js".into() }),
        }
    }

    #[test]
    fn a_fully_populated_manifest_validates() {
        let manifest = PluginManifest::validate(valid_raw()).unwrap();
        assert_eq!(manifest.name, "echo");
        assert_eq!(manifest.capabilities, vec!["logger", "fetch"]);
    }

    #[test]
    fn missing_name_is_reported_specifically() {
        let mut raw = valid_raw();
        raw.name = None;
        assert_eq!(PluginManifest::validate(raw).unwrap_err(), ManifestError::MissingName);
    }

    #[test]
    fn missing_engines_is_reported_specifically() {
        let mut raw = valid_raw();
        raw.engines = None;
        assert_eq!(PluginManifest::validate(raw).unwrap_err(), ManifestError::MissingEngines);
    }

    #[test]
    fn non_array_capabilities_is_rejected() {
        let mut raw = valid_raw();
        raw.capabilities = Some(serde_json::json!("not-an-array"));
        assert_eq!(
            PluginManifest::validate(raw).unwrap_err(),
            ManifestError::CapabilitiesNotArray
        );
    }

    #[test]
    fn missing_entry_default_is_reported_specifically() {
        let mut raw = valid_raw();
        raw.entry = None;
        assert_eq!(
            PluginManifest::validate(raw).unwrap_err(),
            ManifestError::MissingEntryDefault
        );
    }

    #[test]
    fn absent_capabilities_defaults_to_empty() {
        let mut raw = valid_raw();
        raw.capabilities = None;
        let manifest = PluginManifest::validate(raw).unwrap();
        assert!(manifest.capabilities.is_empty());
    }
}
