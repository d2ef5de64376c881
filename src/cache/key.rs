//! Cache key derivation.
//!
//! A key is the identity of a cacheable request: the method (GET or HEAD)
//! and the canonical request target — path plus query string, fragment
//! already excluded at parse time. The xxh3 hash is precomputed once and
//! reused for both in-memory lookups and the on-disk shard path.

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::xxh3_64;

use crate::http::Method;

/// The subset of methods whose responses can enter the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheableMethod {
    Get,
    Head,
}

impl CacheableMethod {
    /// Narrows an HTTP method to the cacheable subset.
    pub fn from_method(method: &Method) -> Option<Self> {
        match method {
            Method::Get => Some(Self::Get),
            Method::Head => Some(Self::Head),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
        }
    }
}

/// Deterministic identity of a cacheable request.
///
/// Two requests with the same method and canonical target always produce
/// equal keys with equal hashes; HEAD and GET for the same target produce
/// distinct keys, so a bodyless HEAD entry can never answer a GET.
///
/// # Examples
///
/// ```
/// use recap::cache::CacheKey;
/// use recap::http::Method;
///
/// let a = CacheKey::from_request(&Method::Get, "/api/items?page=2").unwrap();
/// let b = CacheKey::from_request(&Method::Get, "/api/items?page=2").unwrap();
/// assert_eq!(a, b);
///
/// assert!(CacheKey::from_request(&Method::Post, "/api/items").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    method: CacheableMethod,
    target: Box<str>,
    hash: u64,
}

impl CacheKey {
    /// Builds a key from a method and canonical target.
    ///
    /// Returns `None` for methods outside the cacheable subset; callers use
    /// that as the signal to bypass the cache entirely.
    pub fn from_request(method: &Method, target: &str) -> Option<Self> {
        let method = CacheableMethod::from_method(method)?;
        Some(Self::new(method, target))
    }

    fn new(method: CacheableMethod, target: &str) -> Self {
        let hash = Self::compute_hash(method, target);
        Self {
            method,
            target: target.into(),
            hash,
        }
    }

    // Method and target are NUL-separated so "GET" + "/a" can never collide
    // with a hypothetical method "GE" + "T/a".
    fn compute_hash(method: CacheableMethod, target: &str) -> u64 {
        let mut data = Vec::with_capacity(method.as_str().len() + target.len() + 1);
        data.extend_from_slice(method.as_str().as_bytes());
        data.push(b'\x00');
        data.extend_from_slice(target.as_bytes());
        xxh3_64(&data)
    }

    pub fn method(&self) -> CacheableMethod {
        self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// Relative path components for the on-disk layout.
    ///
    /// The top two hash bytes fan entries out across a `aa/bb/` directory
    /// tree so no single directory accumulates every entry.
    pub fn to_path_components(&self) -> (String, String, String) {
        let dir1 = format!("{:02x}", (self.hash >> 56) as u8);
        let dir2 = format!("{:02x}", (self.hash >> 48) as u8);
        let filename = format!("{:016x}.entry", self.hash);
        (dir1, dir2, filename)
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_request_same_key() {
        let a = CacheKey::from_request(&Method::Get, "/api/users?page=1").unwrap();
        let b = CacheKey::from_request(&Method::Get, "/api/users?page=1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn query_string_distinguishes_keys() {
        let a = CacheKey::from_request(&Method::Get, "/api/users?page=1").unwrap();
        let b = CacheKey::from_request(&Method::Get, "/api/users?page=2").unwrap();
        assert_ne!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn head_and_get_are_distinct() {
        let get = CacheKey::from_request(&Method::Get, "/index.html").unwrap();
        let head = CacheKey::from_request(&Method::Head, "/index.html").unwrap();
        assert_ne!(get, head);
        assert_ne!(get.hash_value(), head.hash_value());
    }

    #[test]
    fn non_cacheable_methods_have_no_key() {
        assert!(CacheKey::from_request(&Method::Post, "/submit").is_none());
        assert!(CacheKey::from_request(&Method::Delete, "/item/1").is_none());
    }

    #[test]
    fn path_components_shape() {
        let key = CacheKey::from_request(&Method::Get, "/x").unwrap();
        let (dir1, dir2, filename) = key.to_path_components();
        assert_eq!(dir1.len(), 2);
        assert_eq!(dir2.len(), 2);
        assert!(filename.ends_with(".entry"));
        assert_eq!(filename.len(), 16 + ".entry".len());
    }
}
