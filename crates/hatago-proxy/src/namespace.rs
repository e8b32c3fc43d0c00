//! Namespace manager (C3): maps `(serverConfig, remoteTool)` pairs onto a
//! single collision-free tool namespace (§4.3).

use std::collections::HashMap;

use regex::Regex;

use crate::error::{ProxyError, ProxyResult};

const DEFAULT_SEPARATOR: &str = ":";
const DEFAULT_MAX_LENGTH: usize = 64;
const MAX_COLLISION_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceStrategy {
    Prefix,
    Suffix,
}

#[derive(Debug, Clone)]
pub enum CollisionPolicy {
    Error,
    Skip,
    /// `prefix_format`, if set, substitutes `{server}`/`{index}`; otherwise
    /// collisions are resolved as `"{candidate}{sep}{n}"` for increasing `n`.
    Rename { prefix_format: Option<String> },
}

/// Per-upstream naming configuration (the namespace-relevant subset of
/// `UpstreamServerConfig`, §3).
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    pub server_id: String,
    pub namespace: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub rename: HashMap<String, String>,
    pub separator: String,
    pub max_length: usize,
    pub strategy: NamespaceStrategy,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            namespace: None,
            include: Vec::new(),
            exclude: Vec::new(),
            rename: HashMap::new(),
            separator: DEFAULT_SEPARATOR.to_string(),
            max_length: DEFAULT_MAX_LENGTH,
            strategy: NamespaceStrategy::Prefix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolMapping {
    pub public_name: String,
    pub server_id: String,
    pub remote_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct NamespaceStats {
    pub total: usize,
    pub conflicts: usize,
    pub per_server: HashMap<String, usize>,
}

const REGEX_META_CHARS: &str = r".+()[]{}|^$\";

fn glob_to_regex(pattern: &str) -> Regex {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if REGEX_META_CHARS.contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    Regex::new(&out).unwrap_or_else(|_| Regex::new("$^").expect("empty-match fallback regex"))
}

fn matches_any(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|pattern| glob_to_regex(pattern).is_match(name))
}

static NAME_CHARS: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

fn valid_name_chars() -> &'static Regex {
    NAME_CHARS.get_or_init(|| Regex::new(r"^[A-Za-z0-9_:.\-]+$").expect("valid static pattern"))
}

/// Owns the collision-free mapping table across every registered upstream.
pub struct NamespaceManager {
    collision_policy: CollisionPolicy,
    mappings: HashMap<String, ToolMapping>,
    stats: NamespaceStats,
}

impl NamespaceManager {
    pub fn new(collision_policy: CollisionPolicy) -> Self {
        Self {
            collision_policy,
            mappings: HashMap::new(),
            stats: NamespaceStats::default(),
        }
    }

    pub fn stats(&self) -> &NamespaceStats {
        &self.stats
    }

    pub fn mapping(&self, public_name: &str) -> Option<&ToolMapping> {
        self.mappings.get(public_name)
    }

    pub fn mappings(&self) -> impl Iterator<Item = &ToolMapping> {
        self.mappings.values()
    }

    /// Run one remote tool through the full six-step algorithm and, on
    /// success, register it.
    pub fn register(&mut self, config: &NamespaceConfig, remote_tool_name: &str) -> ProxyResult<ToolMapping> {
        // 1. Filter.
        if matches_any(&config.exclude, remote_tool_name) {
            return Err(ProxyError::Excluded {
                name: remote_tool_name.to_string(),
            });
        }
        if !config.include.is_empty() && !matches_any(&config.include, remote_tool_name) {
            return Err(ProxyError::Excluded {
                name: remote_tool_name.to_string(),
            });
        }

        // 2. Rename.
        let base = config
            .rename
            .get(remote_tool_name)
            .cloned()
            .unwrap_or_else(|| remote_tool_name.to_string());

        // 3. Namespace strategy.
        let ns = config.namespace.clone().unwrap_or_else(|| config.server_id.clone());
        let sep = &config.separator;
        let candidate = match config.strategy {
            NamespaceStrategy::Prefix => format!("{ns}{sep}{base}"),
            NamespaceStrategy::Suffix => format!("{base}{sep}{ns}"),
        };

        // 4. Validate.
        if !valid_name_chars().is_match(&candidate) {
            return Err(ProxyError::InvalidName { name: candidate });
        }
        if candidate.len() > config.max_length {
            return Err(ProxyError::NameTooLong {
                name: candidate,
                max: config.max_length,
            });
        }

        // 5. Resolve collision.
        let final_name = if !self.mappings.contains_key(&candidate) {
            candidate
        } else {
            self.stats.conflicts += 1;
            match &self.collision_policy {
                CollisionPolicy::Error => {
                    return Err(ProxyError::Conflict { name: candidate });
                }
                CollisionPolicy::Skip => {
                    return Err(ProxyError::Skipped { name: candidate });
                }
                CollisionPolicy::Rename { prefix_format } => {
                    self.resolve_rename_collision(&candidate, sep, &config.server_id, prefix_format)?
                }
            }
        };

        // 6. Register.
        let mapping = ToolMapping {
            public_name: final_name.clone(),
            server_id: config.server_id.clone(),
            remote_name: remote_tool_name.to_string(),
        };
        tracing::debug!(
            public_name = %mapping.public_name,
            server_id = %mapping.server_id,
            remote_name = %mapping.remote_name,
            "registered tool mapping"
        );
        self.mappings.insert(final_name, mapping.clone());
        self.stats.total += 1;
        *self.stats.per_server.entry(config.server_id.clone()).or_insert(0) += 1;

        Ok(mapping)
    }

    fn resolve_rename_collision(
        &self,
        candidate: &str,
        sep: &str,
        server_id: &str,
        prefix_format: &Option<String>,
    ) -> ProxyResult<String> {
        for n in 2..=MAX_COLLISION_ATTEMPTS + 1 {
            let attempt = match prefix_format {
                Some(format) => format
                    .replace("{server}", server_id)
                    .replace("{index}", &n.to_string())
                    + sep
                    + candidate,
                None => format!("{candidate}{sep}{n}"),
            };
            if !self.mappings.contains_key(&attempt) {
                return Ok(attempt);
            }
        }
        Err(ProxyError::CollisionUnresolved {
            name: candidate.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server_id: &str) -> NamespaceConfig {
        NamespaceConfig {
            server_id: server_id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn prefix_strategy_produces_server_colon_name() {
        let mut manager = NamespaceManager::new(CollisionPolicy::Error);
        let mapping = manager.register(&config("srv1"), "search").unwrap();
        assert_eq!(mapping.public_name, "srv1:search");
    }

    #[test]
    fn suffix_strategy_appends_namespace() {
        let mut manager = NamespaceManager::new(CollisionPolicy::Error);
        let config = NamespaceConfig {
            strategy: NamespaceStrategy::Suffix,
            ..config("srv1")
        };
        let mapping = manager.register(&config, "search").unwrap();
        assert_eq!(mapping.public_name, "search:srv1");
    }

    #[test]
    fn exclude_glob_blocks_matching_tools() {
        let mut manager = NamespaceManager::new(CollisionPolicy::Error);
        let config = NamespaceConfig {
            exclude: vec!["internal_*".to_string()],
            ..config("srv1")
        };
        let result = manager.register(&config, "internal_debug");
        assert!(matches!(result, Err(ProxyError::Excluded { .. })));
    }

    #[test]
    fn include_glob_requires_a_match() {
        let mut manager = NamespaceManager::new(CollisionPolicy::Error);
        let config = NamespaceConfig {
            include: vec!["public_*".to_string()],
            ..config("srv1")
        };
        assert!(manager.register(&config, "other").is_err());
        assert!(manager.register(&config, "public_search").is_ok());
    }

    #[test]
    fn rename_map_substitutes_base_name() {
        let mut manager = NamespaceManager::new(CollisionPolicy::Error);
        let config = NamespaceConfig {
            rename: HashMap::from([("old_name".to_string(), "new_name".to_string())]),
            ..config("srv1")
        };
        let mapping = manager.register(&config, "old_name").unwrap();
        assert_eq!(mapping.public_name, "srv1:new_name");
    }

    #[test]
    fn collision_policy_error_fails_second_registration() {
        let mut manager = NamespaceManager::new(CollisionPolicy::Error);
        manager.register(&config("srv1"), "search").unwrap();
        let second = NamespaceConfig {
            namespace: Some("srv1".to_string()),
            ..config("srv2")
        };
        let result = manager.register(&second, "search");
        assert!(matches!(result, Err(ProxyError::Conflict { .. })));
    }

    #[test]
    fn collision_policy_rename_appends_counter() {
        let mut manager = NamespaceManager::new(CollisionPolicy::Rename { prefix_format: None });
        manager.register(&config("srv1"), "search").unwrap();
        let second = NamespaceConfig {
            namespace: Some("srv1".to_string()),
            ..config("srv2")
        };
        let mapping = manager.register(&second, "search").unwrap();
        assert_eq!(mapping.public_name, "srv1:search:2");
    }

    #[test]
    fn name_exceeding_max_length_is_rejected() {
        let mut manager = NamespaceManager::new(CollisionPolicy::Error);
        let config = NamespaceConfig {
            max_length: 10,
            ..config("srv1")
        };
        let result = manager.register(&config, "a_very_long_tool_name_indeed");
        assert!(matches!(result, Err(ProxyError::NameTooLong { .. })));
    }

    #[test]
    fn name_with_invalid_characters_is_rejected() {
        let mut manager = NamespaceManager::new(CollisionPolicy::Error);
        let config = NamespaceConfig {
            rename: HashMap::from([("x".to_string(), "bad name!".to_string())]),
            ..config("srv1")
        };
        let result = manager.register(&config, "x");
        assert!(matches!(result, Err(ProxyError::InvalidName { .. })));
    }

    #[test]
    fn stats_track_totals_and_conflicts_per_server() {
        let mut manager = NamespaceManager::new(CollisionPolicy::Skip);
        manager.register(&config("srv1"), "search").unwrap();
        let second = NamespaceConfig {
            namespace: Some("srv1".to_string()),
            ..config("srv2")
        };
        let _ = manager.register(&second, "search");
        assert_eq!(manager.stats().total, 1);
        assert_eq!(manager.stats().conflicts, 1);
        assert_eq!(manager.stats().per_server.get("srv1"), Some(&1));
    }
}
