//! The caching reverse-proxy request handler.
//!
//! [`ProxyService::handle`] is the entire behavioral surface: compute the
//! cache key, serve fresh hits, revalidate stale ones, forward everything
//! else to the single upstream origin, and store cacheable responses on the
//! way back out.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::entry::now_unix;
use crate::cache::{policy, CacheControl, CacheEntry, CacheKey, CacheStore, Cacheability};
use crate::http::{Headers, Request, Response, StatusCode};
use crate::upstream::{UpstreamClient, UpstreamError, UpstreamResponse};

/// Pseudonym written into `Via` headers on both legs.
const VIA_TOKEN: &str = "1.1 recap";

/// Connection-scoped headers that must not be forwarded (RFC 9110 §7.6.1).
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The caching reverse proxy.
///
/// Holds the injected [`CacheStore`] and the upstream client; all per-request
/// state lives on the stack of [`handle`](Self::handle).
pub struct ProxyService {
    store: Arc<dyn CacheStore>,
    client: UpstreamClient,
    default_ttl_secs: u64,
    stale_if_error_secs: u64,
}

impl ProxyService {
    pub fn new(
        store: Arc<dyn CacheStore>,
        client: UpstreamClient,
        default_ttl_secs: u64,
        stale_if_error_secs: u64,
    ) -> Self {
        Self {
            store,
            client,
            default_ttl_secs,
            stale_if_error_secs,
        }
    }

    /// Handles one inbound request end to end.
    pub async fn handle(&self, request: Request, peer: SocketAddr) -> Response {
        let start = Instant::now();
        let method = request.method().clone();
        let target = request.target();

        let response = self.dispatch(&request, &target, peer).await;

        let cache_state = response.headers().get("x-cache").unwrap_or("-").to_owned();
        info!(
            "{} {} - {} {} ({:?})",
            method,
            target,
            response.status().as_u16(),
            cache_state,
            start.elapsed()
        );
        response
    }

    async fn dispatch(&self, request: &Request, target: &str, peer: SocketAddr) -> Response {
        // Methods outside the cacheable set never touch the store.
        let Some(key) = CacheKey::from_request(request.method(), target) else {
            return match self.forward(request, target, peer, None).await {
                Ok(upstream) => decorate(into_response(upstream)),
                Err(e) => gateway_error(&e),
            };
        };

        if policy::request_bypasses_cache(request.headers()) {
            return self.fetch_and_store(request, target, peer, &key).await;
        }

        let cached = match self.store.get(&key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "cache read failed, treating as miss");
                None
            }
        };

        match cached {
            Some(entry) if entry.fresh_at(now_unix()) => from_cache(entry, "HIT"),
            Some(entry) => self.revalidate(request, target, peer, &key, entry).await,
            None => self.fetch_and_store(request, target, peer, &key).await,
        }
    }

    /// Miss path: forward, classify, store, respond.
    async fn fetch_and_store(
        &self,
        request: &Request,
        target: &str,
        peer: SocketAddr,
        key: &CacheKey,
    ) -> Response {
        let upstream = match self.forward(request, target, peer, None).await {
            Ok(upstream) => upstream,
            Err(e) => return gateway_error(&e),
        };

        self.maybe_store(request, key, &upstream).await;

        let mut response = decorate(into_response(upstream));
        response.set_header("X-Cache", "MISS");
        response
    }

    /// Stale-hit path: conditional fetch, refresh on 304, replace on a full
    /// response, fall back to the stale entry when the origin is down.
    async fn revalidate(
        &self,
        request: &Request,
        target: &str,
        peer: SocketAddr,
        key: &CacheKey,
        mut entry: CacheEntry,
    ) -> Response {
        let conditionals = conditional_headers(&entry);
        if conditionals.is_empty() {
            // No validators stored: a stale entry can only be replaced whole.
            return self.fetch_and_store(request, target, peer, key).await;
        }

        match self.forward(request, target, peer, Some(&conditionals)).await {
            Ok(upstream) if upstream.status == 304 => {
                // Freshness comes from the updated header set: directives on
                // the 304 override, stored ones fill in.
                let mut merged = entry.headers().clone();
                for (name, value) in upstream.headers.iter() {
                    merged.set(name, value);
                }
                let ttl = policy::freshness_lifetime(&merged, self.default_ttl_secs);
                entry.refresh(&upstream.headers, ttl);
                if let Err(e) = self.store.put(key, &entry).await {
                    warn!(error = %e, "failed to refresh cache entry");
                }
                from_cache(entry, "REVALIDATED")
            }
            Ok(upstream) => {
                self.maybe_store(request, key, &upstream).await;
                let mut response = decorate(into_response(upstream));
                response.set_header("X-Cache", "MISS");
                response
            }
            Err(e) => {
                if self.stale_serve_allowed(&entry) {
                    warn!(error = %e, "upstream unavailable, serving stale entry");
                    from_cache(entry, "STALE")
                } else {
                    gateway_error(&e)
                }
            }
        }
    }

    /// Writes the response into the store when policy allows. Failures are
    /// logged and swallowed: caching is best-effort and must never fail the
    /// live response.
    async fn maybe_store(&self, request: &Request, key: &CacheKey, upstream: &UpstreamResponse) {
        if policy::request_forbids_store(request.headers()) {
            return;
        }
        let ttl = match policy::classify(
            request.method(),
            upstream.status,
            &upstream.headers,
            self.default_ttl_secs,
        ) {
            Cacheability::Cacheable(ttl) => ttl,
            Cacheability::Revalidate => 0,
            Cacheability::NotCacheable => {
                // The origin's answer is no longer storable (e.g. it now says
                // no-store); any previously stored entry is invalid with it.
                if let Err(e) = self.store.delete(key).await {
                    warn!(error = %e, "failed to drop superseded cache entry");
                }
                return;
            }
        };

        let entry = CacheEntry::new(
            upstream.status,
            upstream.headers.clone(),
            upstream.body.clone(),
            ttl,
        );
        if let Err(e) = self.store.put(key, &entry).await {
            warn!(error = %e, "cache write failed, response served uncached");
        }
    }

    fn stale_serve_allowed(&self, entry: &CacheEntry) -> bool {
        let cc = CacheControl::from_headers(entry.headers());
        if cc.must_revalidate {
            return false;
        }
        let window = cc.stale_if_error.unwrap_or(self.stale_if_error_secs);
        entry.stale_for_at(now_unix()) <= window && window > 0
    }

    async fn forward(
        &self,
        request: &Request,
        target: &str,
        peer: SocketAddr,
        conditionals: Option<&Headers>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut headers = forwarded_headers(request, peer);
        if let Some(extra) = conditionals {
            for (name, value) in extra.iter() {
                headers.set(name, value);
            }
        }
        self.client
            .fetch(request.method(), target, &headers, request.body())
            .await
    }
}

/// Copies inbound headers for forwarding: hop-by-hop headers and `Host` are
/// dropped, `X-Forwarded-For` gains the peer address, and `Via` gains this
/// proxy's token.
fn forwarded_headers(request: &Request, peer: SocketAddr) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in request.headers().iter() {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        headers.insert(name, value);
    }

    let peer_ip = peer.ip().to_string();
    let xff = match request.headers().get("x-forwarded-for") {
        Some(prior) => format!("{prior}, {peer_ip}"),
        None => peer_ip,
    };
    headers.set("X-Forwarded-For", xff);

    let via = match request.headers().get("via") {
        Some(prior) => format!("{prior}, {VIA_TOKEN}"),
        None => VIA_TOKEN.to_owned(),
    };
    headers.set("Via", via);

    headers
}

fn conditional_headers(entry: &CacheEntry) -> Headers {
    let mut headers = Headers::new();
    if let Some(etag) = entry.etag() {
        headers.insert("If-None-Match", etag);
    }
    if let Some(last_modified) = entry.last_modified() {
        headers.insert("If-Modified-Since", last_modified);
    }
    headers
}

fn into_response(upstream: UpstreamResponse) -> Response {
    Response::from_parts(
        StatusCode::from_u16(upstream.status),
        upstream.headers,
        upstream.body.to_vec(),
    )
}

/// Builds the client response for a cache-served entry, with the `Age` the
/// entry has accumulated and the `X-Cache` annotation.
fn from_cache(entry: CacheEntry, state: &str) -> Response {
    let age = now_unix().saturating_sub(entry.stored_at());
    let mut response = Response::from_parts(
        StatusCode::from_u16(entry.status()),
        entry.headers().clone(),
        entry.body().to_vec(),
    );
    response.set_header("Age", age.to_string());
    response.set_header("X-Cache", state);
    decorate(response)
}

/// Response-side `Via` token (RFC 9110 §7.6.3 requires it on both legs).
fn decorate(mut response: Response) -> Response {
    let via = match response.headers().get("via") {
        Some(prior) => format!("{prior}, {VIA_TOKEN}"),
        None => VIA_TOKEN.to_owned(),
    };
    response.set_header("Via", via);
    response
}

fn gateway_error(error: &UpstreamError) -> Response {
    warn!(error = %error, "upstream exchange failed");
    match error {
        UpstreamError::TimedOut(_) => Response::new(StatusCode::GatewayTimeout)
            .body("upstream did not respond in time"),
        _ => Response::new(StatusCode::BadGateway).body("upstream unreachable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use bytes::Bytes;

    fn request(raw: &[u8]) -> Request {
        Request::parse(raw).unwrap().0
    }

    fn peer() -> SocketAddr {
        "203.0.113.9:4711".parse().unwrap()
    }

    #[test]
    fn forwarded_headers_strip_hop_by_hop_and_host() {
        let req = request(
            b"GET / HTTP/1.1\r\nHost: front.example\r\nConnection: keep-alive\r\n\
              TE: trailers\r\nAccept: */*\r\n\r\n",
        );
        let headers = forwarded_headers(&req, peer());
        assert!(!headers.contains("host"));
        assert!(!headers.contains("connection"));
        assert!(!headers.contains("te"));
        assert_eq!(headers.get("accept"), Some("*/*"));
    }

    #[test]
    fn forwarded_headers_append_xff_and_via() {
        let req = request(
            b"GET / HTTP/1.1\r\nHost: h\r\nX-Forwarded-For: 198.51.100.1\r\nVia: 1.0 edge\r\n\r\n",
        );
        let headers = forwarded_headers(&req, peer());
        assert_eq!(
            headers.get("x-forwarded-for"),
            Some("198.51.100.1, 203.0.113.9")
        );
        assert_eq!(headers.get("via"), Some("1.0 edge, 1.1 recap"));
    }

    #[test]
    fn conditional_headers_use_stored_validators() {
        let mut h = Headers::new();
        h.insert("ETag", "\"v3\"");
        h.insert("Last-Modified", "Tue, 02 Jan 2024 00:00:00 GMT");
        let entry = CacheEntry::new(200, h, Bytes::new(), 60);

        let cond = conditional_headers(&entry);
        assert_eq!(cond.get("if-none-match"), Some("\"v3\""));
        assert_eq!(
            cond.get("if-modified-since"),
            Some("Tue, 02 Jan 2024 00:00:00 GMT")
        );
    }

    #[test]
    fn no_validators_means_no_conditionals() {
        let entry = CacheEntry::new(200, Headers::new(), Bytes::new(), 60);
        assert!(conditional_headers(&entry).is_empty());
    }

    #[test]
    fn cache_response_carries_age_and_state() {
        let entry = CacheEntry::new(200, Headers::new(), Bytes::from_static(b"x"), 60);
        let response = from_cache(entry, "HIT");
        assert_eq!(response.headers().get("x-cache"), Some("HIT"));
        let age: u64 = response.headers().get("age").unwrap().parse().unwrap();
        assert!(age <= 1);
        assert_eq!(response.headers().get("via"), Some(VIA_TOKEN));
    }

    #[test]
    fn gateway_errors_map_to_status() {
        let timeout = UpstreamError::TimedOut(std::time::Duration::from_secs(1));
        assert_eq!(gateway_error(&timeout).status(), StatusCode::GatewayTimeout);

        let malformed = UpstreamError::Malformed("x");
        assert_eq!(gateway_error(&malformed).status(), StatusCode::BadGateway);
    }

    #[test]
    fn key_skips_unsafe_methods() {
        assert!(CacheKey::from_request(&Method::Post, "/x").is_none());
    }
}
