//! Session ID service (C1): 256-bit random identifiers, format validation,
//! and constant-time comparison.
//!
//! IDs are opaque — never log or echo one in an error message. Logging call
//! sites should go through [`SessionId::redacted`] instead.

use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;

const BYTE_LEN: usize = 32;
const HEX_LEN: usize = BYTE_LEN * 2;

/// A validated 256-bit session identifier, stored as 64 lowercase hex chars.
#[derive(Clone, Eq)]
pub struct SessionId(String);

/// Why a candidate string failed to parse as a [`SessionId`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("session id must be {HEX_LEN} lowercase hex characters, got {len} chars")]
pub struct InvalidSessionId {
    len: usize,
}

impl SessionId {
    /// Draw 32 bytes from a cryptographically strong source and hex-encode them.
    pub fn generate() -> Self {
        use ring::rand::{SecureRandom, SystemRandom};

        let rng = SystemRandom::new();
        let mut bytes = [0u8; BYTE_LEN];
        rng.fill(&mut bytes)
            .expect("system RNG unavailable; cannot mint a session id");
        Self(hex_encode(&bytes))
    }

    /// Parse and validate against `^[a-f0-9]{64}$`. The match is case-insensitive
    /// per §4.1 but the stored form is always lowercased.
    pub fn parse(candidate: &str) -> Result<Self, InvalidSessionId> {
        if candidate.len() != HEX_LEN || !candidate.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidSessionId {
                len: candidate.len(),
            });
        }
        Ok(Self(candidate.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An 8-char prefix suitable for log lines; never the full id.
    pub fn redacted(&self) -> String {
        format!("{}…", &self.0[..8])
    }
}

impl PartialEq for SessionId {
    /// Length check first (public, not timing-sensitive), then a
    /// constant-time byte comparison so an attacker probing guesses can't
    /// learn how many leading bytes matched.
    fn eq(&self, other: &Self) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.redacted())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::hash::Hash for SessionId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String cannot fail");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_64_lowercase_hex_chars() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(id.as_str(), id.as_str().to_ascii_lowercase());
    }

    #[test]
    fn generate_is_unpredictable_between_calls() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn parse_accepts_uppercase_and_normalizes() {
        let upper = "A".repeat(64);
        let id = SessionId::parse(&upper).unwrap();
        assert_eq!(id.as_str(), "a".repeat(64));
    }

    #[test]
    fn parse_rejects_63_hex_chars() {
        let short = "a".repeat(63);
        assert!(SessionId::parse(&short).is_err());
    }

    #[test]
    fn parse_rejects_65_hex_chars() {
        let long = "a".repeat(65);
        assert!(SessionId::parse(&long).is_err());
    }

    #[test]
    fn parse_rejects_non_hex_characters() {
        let mut candidate = "a".repeat(63);
        candidate.push('g');
        assert!(SessionId::parse(&candidate).is_err());
    }

    #[test]
    fn equality_is_reflexive_and_structural() {
        let a = SessionId::parse(&"1".repeat(64)).unwrap();
        let b = SessionId::parse(&"1".repeat(64)).unwrap();
        let c = SessionId::parse(&"2".repeat(64)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn redacted_never_exposes_the_full_id() {
        let id = SessionId::generate();
        let redacted = id.redacted();
        assert!(redacted.len() < id.as_str().len());
        assert!(!redacted.contains(id.as_str()));
    }
}
