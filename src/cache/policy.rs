//! Cache policy: Cache-Control parsing and cacheability classification.
//!
//! Classification is a pure function from `(method, status, headers)` to a
//! [`Cacheability`] verdict, so the rules are testable without touching the
//! store or the network.

use chrono::DateTime;

use crate::cache::entry::now_unix;
use crate::http::{Headers, Method};

/// Response statuses a shared cache may store (RFC 9111 §3, narrowed to the
/// heuristically-cacheable set this proxy serves).
const CACHEABLE_STATUSES: [u16; 5] = [200, 203, 300, 301, 410];

/// Parsed `Cache-Control` directives relevant to a shared cache.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub max_age: Option<u64>,
    /// Shared-cache lifetime; takes precedence over `max_age`.
    pub s_maxage: Option<u64>,
    pub no_cache: bool,
    pub no_store: bool,
    pub private: bool,
    pub public: bool,
    pub must_revalidate: bool,
    pub stale_if_error: Option<u64>,
}

impl CacheControl {
    /// Parses a single `Cache-Control` header value.
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();
        cc.merge(value);
        cc
    }

    /// Parses and merges every `Cache-Control` header in `headers`.
    ///
    /// Multiple header lines are equivalent to one comma-joined line
    /// (RFC 9110 §5.3), so directives accumulate.
    pub fn from_headers(headers: &Headers) -> Self {
        let mut cc = Self::default();
        for value in headers.get_all("cache-control") {
            cc.merge(value);
        }
        cc
    }

    fn merge(&mut self, value: &str) {
        for directive in value.split(',') {
            let directive = directive.trim().to_lowercase();
            if directive == "no-cache" {
                self.no_cache = true;
            } else if directive == "no-store" {
                self.no_store = true;
            } else if directive == "private" {
                self.private = true;
            } else if directive == "public" {
                self.public = true;
            } else if directive == "must-revalidate" {
                self.must_revalidate = true;
            } else if let Some(v) = directive.strip_prefix("max-age=") {
                self.max_age = v.parse().ok();
            } else if let Some(v) = directive.strip_prefix("s-maxage=") {
                self.s_maxage = v.parse().ok();
            } else if let Some(v) = directive.strip_prefix("stale-if-error=") {
                self.stale_if_error = v.parse().ok();
            }
        }
    }
}

/// Verdict of the cacheability classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheability {
    /// Store with the given freshness lifetime in seconds.
    Cacheable(u64),
    /// Do not store.
    NotCacheable,
    /// Store, but with zero freshness: every later use must revalidate
    /// against the origin first.
    Revalidate,
}

/// Classifies an upstream response.
///
/// A response is storable when the method is GET/HEAD, the status is in the
/// cacheable set, no `no-store`/`private` directive applies, and it does not
/// vary on request headers. The lifetime comes from `s-maxage`, then
/// `max-age`, then `Expires` − `Date`, then `default_ttl`. `no-cache` (or an
/// explicit zero lifetime) stores the response but forces revalidation on
/// every use.
pub fn classify(method: &Method, status: u16, headers: &Headers, default_ttl: u64) -> Cacheability {
    if !method.is_cacheable() {
        return Cacheability::NotCacheable;
    }
    if !CACHEABLE_STATUSES.contains(&status) {
        return Cacheability::NotCacheable;
    }
    // This proxy keys on method + target only: a response that varies on
    // request headers cannot be stored under that identity.
    if headers.contains("vary") {
        return Cacheability::NotCacheable;
    }

    let cc = CacheControl::from_headers(headers);
    if cc.no_store || cc.private {
        return Cacheability::NotCacheable;
    }

    let ttl = freshness_lifetime(headers, default_ttl);
    if cc.no_cache || ttl == 0 {
        return Cacheability::Revalidate;
    }
    Cacheability::Cacheable(ttl)
}

/// Freshness lifetime of a response: `s-maxage`, then `max-age`, then
/// `Expires` − `Date`, then `default_ttl`.
///
/// Also used on a `304 Not Modified` to recompute the lifetime of the entry
/// being refreshed.
pub fn freshness_lifetime(headers: &Headers, default_ttl: u64) -> u64 {
    let cc = CacheControl::from_headers(headers);
    cc.s_maxage
        .or(cc.max_age)
        .or_else(|| expires_lifetime(headers))
        .unwrap_or(default_ttl)
}

/// Freshness lifetime from `Expires` − `Date`, when `Cache-Control` gives
/// none.
///
/// An `Expires` value that fails to parse as an HTTP-date means "already
/// expired" (RFC 9111 §5.3), reported as a zero lifetime rather than
/// absence.
fn expires_lifetime(headers: &Headers) -> Option<u64> {
    let expires = headers.get("expires")?;
    let Some(expires) = parse_http_date(expires) else {
        return Some(0);
    };
    let reference = headers
        .get("date")
        .and_then(parse_http_date)
        .unwrap_or_else(now_unix);
    Some(expires.saturating_sub(reference))
}

fn parse_http_date(value: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc2822(value).ok()?;
    u64::try_from(parsed.timestamp()).ok()
}

/// Returns `true` if the request asks to bypass cache lookup
/// (`Cache-Control: no-cache`/`no-store` or `Pragma: no-cache`).
///
/// Bypassing lookup does not by itself forbid storing the response; see
/// [`request_forbids_store`].
pub fn request_bypasses_cache(headers: &Headers) -> bool {
    let cc = CacheControl::from_headers(headers);
    if cc.no_cache || cc.no_store {
        return true;
    }
    headers
        .get("pragma")
        .is_some_and(|v| v.eq_ignore_ascii_case("no-cache"))
}

/// Returns `true` if the request forbids storing the response
/// (`Cache-Control: no-store`).
pub fn request_forbids_store(headers: &Headers) -> bool {
    CacheControl::from_headers(headers).no_store
}
