//! Cache key derivation.
//!
//! A [`CacheKey`] is the hex SHA-256 of the request identity and the token,
//! each field length-prefixed so that adjacent fields cannot alias
//! (`("/ab", "c")` and `("/a", "bc")` hash differently).

use std::fmt;

use sha2::{Digest, Sha256};

use crate::Request;
use crate::config::IdempotencyConfig;

/// Deterministic address of a stored response and of its in-flight slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The parts of a request that must match for a stored response to be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    method: String,
    path: String,
    query: Option<String>,
    body_digest: Option<[u8; 32]>,
}

impl RequestIdentity {
    /// Identity from method and path alone.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: None,
            body_digest: None,
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body_digest = Some(Sha256::digest(body).into());
        self
    }

    /// Builds the identity of `request` under the matching rules in `config`.
    pub fn from_request(request: &Request, config: &IdempotencyConfig) -> Self {
        let mut identity = Self::new(request.method().as_str(), request.path());
        if config.match_query {
            if let Some(query) = request.query_string() {
                identity = identity.with_query(query);
            }
        }
        if config.match_body {
            identity = identity.with_body(request.body());
        }
        identity
    }
}

/// Derives the cache key for `token` presented on a request with `identity`.
///
/// Total and pure: equal inputs always give equal keys.
pub fn derive_key(identity: &RequestIdentity, token: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, identity.method.as_bytes());
    write_field(&mut hasher, identity.path.as_bytes());
    write_optional(&mut hasher, identity.query.as_deref().map(str::as_bytes));
    write_optional(&mut hasher, identity.body_digest.as_ref().map(|d| d.as_slice()));
    write_field(&mut hasher, token.as_bytes());
    CacheKey(format!("{:x}", hasher.finalize()))
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

// Absent and empty must not collide, so presence gets its own tag byte.
fn write_optional(hasher: &mut Sha256, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            hasher.update([1u8]);
            write_field(hasher, bytes);
        }
        None => hasher.update([0u8]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    fn post(path: &str) -> RequestIdentity {
        RequestIdentity::new("POST", path)
    }

    #[test]
    fn same_inputs_same_key() {
        let a = derive_key(&post("/orders").with_body(b"{}"), "key-1");
        let b = derive_key(&post("/orders").with_body(b"{}"), "key-1");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn token_method_path_and_body_all_matter() {
        let base = derive_key(&post("/orders"), "key-1");
        assert_ne!(base, derive_key(&post("/orders"), "key-2"));
        assert_ne!(base, derive_key(&post("/refunds"), "key-1"));
        assert_ne!(base, derive_key(&RequestIdentity::new("PUT", "/orders"), "key-1"));
        assert_ne!(base, derive_key(&post("/orders").with_body(b"x"), "key-1"));
    }

    #[test]
    fn field_boundaries_do_not_alias() {
        assert_ne!(derive_key(&post("/ab"), "c"), derive_key(&post("/a"), "bc"));
        assert_ne!(
            derive_key(&post("/a").with_query(""), "t"),
            derive_key(&post("/a"), "t")
        );
        assert_ne!(
            derive_key(&post("/a").with_body(b""), "t"),
            derive_key(&post("/a"), "t")
        );
    }

    #[test]
    fn from_request_honours_matching_rules() {
        let request = Request::new(Method::Post, "/orders?page=2").with_body("payload");
        let strict = IdempotencyConfig::default();
        let loose = IdempotencyConfig::default()
            .with_match_query(false)
            .with_match_body(false);

        assert_eq!(
            RequestIdentity::from_request(&request, &loose),
            RequestIdentity::new("POST", "/orders")
        );
        assert_eq!(
            RequestIdentity::from_request(&request, &strict),
            RequestIdentity::new("POST", "/orders")
                .with_query("page=2")
                .with_body(b"payload")
        );
    }
}
