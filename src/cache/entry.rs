//! Cache entries and their on-disk encoding.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::Headers;

/// Seconds since the unix epoch.
///
/// Entries carry wall-clock timestamps rather than monotonic instants so
/// freshness survives a process restart.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Errors produced while decoding an entry file.
///
/// Any of these means the file is corrupt or truncated; the store deletes it
/// and reports a miss.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("entry file truncated")]
    Truncated,

    #[error("entry metadata is not valid JSON: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("body length mismatch: metadata says {expected} bytes, file has {actual}")]
    BodyLength { expected: usize, actual: usize },
}

/// The persisted metadata half of an entry file.
#[derive(Serialize, Deserialize)]
struct EntryMeta {
    status: u16,
    headers: Headers,
    stored_at: u64,
    ttl_secs: u64,
    etag: Option<String>,
    last_modified: Option<String>,
    body_len: usize,
}

/// A cached upstream response.
///
/// Immutable once stored, with one exception: a `304 Not Modified` from the
/// origin refreshes the freshness metadata and headers around the same body
/// via [`CacheEntry::refresh`].
///
/// # Examples
///
/// ```
/// use recap::cache::CacheEntry;
/// use recap::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("ETag", "\"v1\"");
/// let entry = CacheEntry::new(200, headers, b"hello".as_ref().into(), 60);
///
/// assert!(entry.fresh_at(entry.stored_at() + 59));
/// assert!(!entry.fresh_at(entry.stored_at() + 60));
/// assert_eq!(entry.etag(), Some("\"v1\""));
/// ```
#[derive(Debug, Clone)]
pub struct CacheEntry {
    status: u16,
    headers: Headers,
    body: Bytes,
    stored_at: u64,
    ttl_secs: u64,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl CacheEntry {
    /// Length of the big-endian metadata-size prefix at the start of a file.
    const PREFIX_LEN: usize = 4;

    /// Creates an entry stamped with the current time.
    ///
    /// Validators (`ETag`, `Last-Modified`) are extracted from `headers` for
    /// later conditional revalidation.
    pub fn new(status: u16, headers: Headers, body: Bytes, ttl_secs: u64) -> Self {
        let (etag, last_modified) = extract_validators(&headers);
        Self {
            status,
            headers,
            body,
            stored_at: now_unix(),
            ttl_secs,
            etag,
            last_modified,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn stored_at(&self) -> u64 {
        self.stored_at
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    /// Returns `true` if the entry is still within its freshness lifetime at
    /// the given wall-clock time.
    pub fn fresh_at(&self, now: u64) -> bool {
        now.saturating_sub(self.stored_at) < self.ttl_secs
    }

    /// Seconds the entry has spent beyond its freshness lifetime; zero while
    /// still fresh. Drives the stale-on-error window.
    pub fn stale_for_at(&self, now: u64) -> u64 {
        now.saturating_sub(self.stored_at).saturating_sub(self.ttl_secs)
    }

    /// Applies a `304 Not Modified` revalidation: refreshed headers replace
    /// their stored counterparts, the timestamp and lifetime reset, and the
    /// body is kept as-is.
    pub fn refresh(&mut self, fresh_headers: &Headers, ttl_secs: u64) {
        for (name, value) in fresh_headers.iter() {
            // A 304 carries no body, so its framing headers do not describe
            // the stored representation.
            if matches!(
                name.to_ascii_lowercase().as_str(),
                "content-length" | "transfer-encoding" | "connection" | "keep-alive"
            ) {
                continue;
            }
            self.headers.set(name, value);
        }
        let (etag, last_modified) = extract_validators(&self.headers);
        self.etag = etag;
        self.last_modified = last_modified;
        self.stored_at = now_unix();
        self.ttl_secs = ttl_secs;
    }

    /// Serializes the entry to the file format: a 4-byte big-endian metadata
    /// length, the JSON metadata, then the raw body bytes.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let meta = EntryMeta {
            status: self.status,
            headers: self.headers.clone(),
            stored_at: self.stored_at,
            ttl_secs: self.ttl_secs,
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
            body_len: self.body.len(),
        };
        let meta_bytes = serde_json::to_vec(&meta)?;

        let mut out = Vec::with_capacity(Self::PREFIX_LEN + meta_bytes.len() + self.body.len());
        out.extend_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&meta_bytes);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Deserializes an entry file, validating that the body is exactly as
    /// long as the metadata claims. Any failure marks the file corrupt.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < Self::PREFIX_LEN {
            return Err(DecodeError::Truncated);
        }
        let meta_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;

        let body_start = Self::PREFIX_LEN + meta_len;
        if raw.len() < body_start {
            return Err(DecodeError::Truncated);
        }

        let meta: EntryMeta = serde_json::from_slice(&raw[Self::PREFIX_LEN..body_start])?;
        let body = &raw[body_start..];
        if body.len() != meta.body_len {
            return Err(DecodeError::BodyLength {
                expected: meta.body_len,
                actual: body.len(),
            });
        }

        Ok(Self {
            status: meta.status,
            headers: meta.headers,
            body: Bytes::copy_from_slice(body),
            stored_at: meta.stored_at,
            ttl_secs: meta.ttl_secs,
            etag: meta.etag,
            last_modified: meta.last_modified,
        })
    }
}

fn extract_validators(headers: &Headers) -> (Option<String>, Option<String>) {
    (
        headers.get("etag").map(str::to_owned),
        headers.get("last-modified").map(str::to_owned),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> CacheEntry {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html");
        headers.insert("ETag", "\"abc123\"");
        headers.insert("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT");
        CacheEntry::new(200, headers, Bytes::from_static(b"<html></html>"), 300)
    }

    #[test]
    fn extracts_validators() {
        let entry = sample_entry();
        assert_eq!(entry.etag(), Some("\"abc123\""));
        assert_eq!(entry.last_modified(), Some("Mon, 01 Jan 2024 00:00:00 GMT"));
    }

    #[test]
    fn freshness_window() {
        let entry = sample_entry();
        let t0 = entry.stored_at();
        assert!(entry.fresh_at(t0));
        assert!(entry.fresh_at(t0 + 299));
        assert!(!entry.fresh_at(t0 + 300));
        assert_eq!(entry.stale_for_at(t0 + 299), 0);
        assert_eq!(entry.stale_for_at(t0 + 360), 60);
    }

    #[test]
    fn encode_decode_round_trip() {
        let entry = sample_entry();
        let raw = entry.encode().unwrap();
        let back = CacheEntry::decode(&raw).unwrap();
        assert_eq!(back.status(), 200);
        assert_eq!(back.body(), entry.body());
        assert_eq!(back.headers().get("content-type"), Some("text/html"));
        assert_eq!(back.stored_at(), entry.stored_at());
        assert_eq!(back.ttl_secs(), 300);
        assert_eq!(back.etag(), Some("\"abc123\""));
    }

    #[test]
    fn decode_rejects_truncated_file() {
        let raw = sample_entry().encode().unwrap();
        assert!(matches!(
            CacheEntry::decode(&raw[..raw.len() - 1]),
            Err(DecodeError::BodyLength { .. })
        ));
        assert!(matches!(
            CacheEntry::decode(&raw[..2]),
            Err(DecodeError::Truncated)
        ));
    }

    #[test]
    fn decode_rejects_garbage_metadata() {
        let mut raw = vec![0, 0, 0, 4];
        raw.extend_from_slice(b"nope");
        assert!(matches!(
            CacheEntry::decode(&raw),
            Err(DecodeError::Metadata(_))
        ));
    }

    #[test]
    fn refresh_updates_metadata_keeps_body() {
        let mut entry = sample_entry();
        let original_body = entry.body().clone();

        let mut fresh = Headers::new();
        fresh.insert("ETag", "\"def456\"");
        fresh.insert("Content-Length", "0"); // framing from the 304, ignored
        entry.refresh(&fresh, 600);

        assert_eq!(entry.body(), &original_body);
        assert_eq!(entry.etag(), Some("\"def456\""));
        assert_eq!(entry.ttl_secs(), 600);
        assert!(!entry.headers().contains("content-length"));
    }
}
