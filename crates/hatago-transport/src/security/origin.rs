//! DNS-rebinding guard (§4.7 step 2): `Host` must be in `allowedHosts`;
//! `Origin`, if present, must be in `allowedOrigins`.
//!
//! **Security model.** A DNS-rebinding attack requires a remote attacker to
//! point a hostname at the victim's loopback address; a client that is
//! already on localhost gained nothing by doing so. So a localhost client
//! presenting no `Origin` header is allowed even with the guard enabled —
//! the same allowance the streaming HTTP transport grants generally, just
//! applied on top of the host check this spec adds.

use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::TransportError;

#[derive(Clone, Debug)]
pub struct DnsRebindingGuardConfig {
    pub enabled: bool,
    pub allowed_hosts: HashSet<String>,
    pub allowed_origins: HashSet<String>,
    pub allow_localhost: bool,
}

impl Default for DnsRebindingGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_hosts: HashSet::new(),
            allowed_origins: HashSet::new(),
            allow_localhost: true,
        }
    }
}

fn is_localhost_like(value: &str) -> bool {
    const PATTERNS: [&str; 6] = [
        "localhost",
        "127.0.0.1",
        "::1",
        "http://localhost",
        "https://localhost",
        "http://127.0.0.1",
    ];
    PATTERNS.iter().any(|pattern| value.starts_with(pattern))
}

/// Validate the `Host` and `Origin` headers of one request against the guard.
pub fn validate_request(
    config: &DnsRebindingGuardConfig,
    host: Option<&str>,
    origin: Option<&str>,
    client_ip: Option<IpAddr>,
) -> Result<(), TransportError> {
    if !config.enabled {
        return Ok(());
    }

    let client_is_loopback = client_ip.is_some_and(|ip| ip.is_loopback());

    match host {
        Some(host) if config.allowed_hosts.contains(host) => {}
        Some(host) if config.allow_localhost && is_localhost_like(host) => {}
        Some(host) => {
            return Err(TransportError::DnsRebindingBlocked {
                reason: format!("host '{host}' not allowed"),
            });
        }
        None => {
            return Err(TransportError::DnsRebindingBlocked {
                reason: "missing Host header".into(),
            });
        }
    }

    match origin {
        Some(origin) if config.allowed_origins.contains(origin) => Ok(()),
        Some(origin) if config.allow_localhost && is_localhost_like(origin) => Ok(()),
        Some(origin) => Err(TransportError::DnsRebindingBlocked {
            reason: format!("origin '{origin}' not allowed"),
        }),
        None if config.allow_localhost && client_is_loopback => Ok(()),
        None => Err(TransportError::DnsRebindingBlocked {
            reason: "missing Origin header from a non-loopback client".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DnsRebindingGuardConfig {
        DnsRebindingGuardConfig {
            allowed_hosts: HashSet::from(["gateway.example.com".to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn disabled_guard_allows_everything() {
        let mut config = config();
        config.enabled = false;
        assert!(validate_request(&config, Some("evil.com"), None, None).is_ok());
    }

    #[test]
    fn allows_configured_host_and_origin() {
        let mut config = config();
        config.allowed_origins.insert("https://trusted.com".into());
        assert!(
            validate_request(
                &config,
                Some("gateway.example.com"),
                Some("https://trusted.com"),
                None
            )
            .is_ok()
        );
    }

    #[test]
    fn blocks_unconfigured_host() {
        let config = config();
        let result = validate_request(&config, Some("evil.com"), None, Some("127.0.0.1".parse().unwrap()));
        assert!(result.is_err());
    }

    #[test]
    fn allows_localhost_host_even_when_not_listed() {
        let config = config();
        assert!(
            validate_request(&config, Some("localhost"), None, Some("127.0.0.1".parse().unwrap()))
                .is_ok()
        );
    }

    #[test]
    fn missing_origin_from_loopback_client_is_allowed() {
        let mut config = config();
        config.allowed_origins.insert("https://trusted.com".into());
        assert!(
            validate_request(
                &config,
                Some("gateway.example.com"),
                None,
                Some("127.0.0.1".parse().unwrap())
            )
            .is_ok()
        );
    }

    #[test]
    fn missing_origin_from_remote_client_is_blocked() {
        let mut config = config();
        config.allowed_origins.insert("https://trusted.com".into());
        let result = validate_request(
            &config,
            Some("gateway.example.com"),
            None,
            Some("203.0.113.7".parse().unwrap()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn blocks_unconfigured_origin() {
        let config = config();
        let result = validate_request(
            &config,
            Some("gateway.example.com"),
            Some("https://evil.com"),
            None,
        );
        assert!(result.is_err());
    }
}
