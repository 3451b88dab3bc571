//! Anonymous caller fingerprinting.
//!
//! The identity hash is a salted SHA-256 over the caller's network address and
//! user-agent. It bounds abuse (one reaction per kind per day) without storing
//! either value. Callers behind the same NAT with the same browser share a hash.

use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, HeaderName};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

pub const DEFAULT_CLIENT_IP_HEADER: &str = "cf-connecting-ip";

/// Lowercase hex digest of `"{salt}|{address}|{user_agent}"`.
pub fn compute_identity(source_address: &str, user_agent: &str, secret_salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret_salt.as_bytes());
    hasher.update(b"|");
    hasher.update(source_address.as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize())
}

/// Resolves the caller address: trusted proxy header first, then the TCP peer.
/// Returns an empty string when neither is known.
pub fn source_address(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_header: Option<&HeaderName>,
) -> String {
    let forwarded = trusted_header
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match (forwarded, peer) {
        (Some(address), _) => address.to_string(),
        (None, Some(peer)) => peer.ip().to_string(),
        (None, None) => String::new(),
    }
}

pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// The pieces of a request that feed [`compute_identity`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallerFingerprint {
    pub address: String,
    pub user_agent: String,
}

impl CallerFingerprint {
    pub fn new(address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user_agent: user_agent.into(),
        }
    }

    pub fn from_request(
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        trusted_header: Option<&HeaderName>,
    ) -> Self {
        Self {
            address: source_address(headers, peer, trusted_header),
            user_agent: user_agent(headers),
        }
    }

    pub fn identity(&self, secret_salt: &str) -> String {
        compute_identity(&self.address, &self.user_agent, secret_salt)
    }
}
