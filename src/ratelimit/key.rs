//! Rate limit key derivation.

use std::fmt;

/// The identity a request arrives with, as seen by the boundary layer.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Authenticated principal id, if any.
    pub principal_id: Option<String>,
    /// Client network address, possibly a comma-separated forwarding list.
    pub client_address: String,
}

impl Identity {
    /// Identity for an authenticated principal.
    pub fn principal(id: impl Into<String>) -> Self {
        Self {
            principal_id: Some(id.into()),
            client_address: String::new(),
        }
    }

    /// Identity for an unauthenticated client address.
    pub fn address(addr: impl Into<String>) -> Self {
        Self {
            principal_id: None,
            client_address: addr.into(),
        }
    }
}

/// A key that partitions rate limit state in the shared store.
///
/// Format: `"<prefix><kind>:<value>"`, e.g. `rl:user:42` or
/// `rl:ip:203.0.113.7`. Opaque to everything but the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derives a canonical rate limit key from a request identity.
///
/// Pure and infallible: a malformed address produces an imperfect but
/// deterministic key rather than an error, so admission control degrades to
/// keying by empty string in the worst case instead of failing closed.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    prefix: String,
}

impl KeyResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Derive the key for an identity.
    ///
    /// An authenticated principal keys by `user:`, everything else by `ip:`
    /// after sanitizing the address.
    pub fn resolve(&self, identity: &Identity) -> RateLimitKey {
        if let Some(principal) = identity.principal_id.as_deref().filter(|p| !p.is_empty()) {
            return RateLimitKey(format!("{}user:{}", self.prefix, principal));
        }

        let address = sanitize_address(&identity.client_address);
        RateLimitKey(format!("{}ip:{}", self.prefix, address))
    }

    /// The glob pattern matching every key this resolver can produce.
    pub fn scan_pattern(&self) -> String {
        format!("{}*", self.prefix)
    }
}

/// Take the first entry of a forwarding list and strip everything that
/// cannot appear in an IPv4/IPv6 address.
fn sanitize_address(address: &str) -> String {
    let first = address.split(',').next().unwrap_or("");
    first
        .chars()
        .filter(|c| c.is_ascii_hexdigit() || *c == ':' || *c == '.')
        .collect()
}
