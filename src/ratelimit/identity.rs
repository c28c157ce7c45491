//! Client identity derivation.

use axum::http::HeaderMap;
use std::net::IpAddr;

/// Header set by the load balancer in front of the request handlers.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Identity used when neither the forwarded-for chain nor the peer address
/// is available. All such clients share one bucket.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// The key a client's requests are counted under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// The shared identity for unidentifiable clients.
    pub fn unknown() -> Self {
        Self(UNKNOWN_IDENTITY.to_string())
    }

    /// Derive the identity from request headers and the transport peer.
    ///
    /// The first entry of `X-Forwarded-For` wins, since the load balancer
    /// prepends the address it saw. Otherwise the peer address is used, and
    /// failing that the unknown identity.
    pub fn from_request(headers: &HeaderMap, peer: Option<IpAddr>) -> Self {
        let forwarded = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty());

        if let Some(first) = forwarded {
            return Self::new(first);
        }

        match peer {
            Some(ip) => Self::new(ip.to_string()),
            None => Self::unknown(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_IDENTITY
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
