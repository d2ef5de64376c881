//! # recap
//!
//! A from-scratch async caching HTTP/1.1 reverse proxy written in Rust.
//!
//! Inbound requests are answered from a disk-backed cache when possible and
//! forwarded to a single configured upstream origin otherwise; cacheable
//! responses are stored on the way back to the client.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use recap::cache::DiskStore;
//! use recap::proxy::ProxyService;
//! use recap::server::Server;
//! use recap::upstream::{UpstreamClient, UpstreamTarget};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(DiskStore::open("./cache", 1024 * 1024 * 1024)?);
//!     let client = UpstreamClient::new(
//!         UpstreamTarget::new("127.0.0.1", 5000),
//!         Duration::from_secs(30),
//!     );
//!     let service = Arc::new(ProxyService::new(store, client, 300, 86_400));
//!
//!     let server = Server::bind("0.0.0.0:8080").await?;
//!     server
//!         .run(move |request, peer| {
//!             let service = Arc::clone(&service);
//!             async move { service.handle(request, peer).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod http;
pub mod proxy;
pub mod server;
pub mod upstream;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheEntry, CacheKey, CacheStore, DiskStore};
pub use config::{ConfigError, ProxyConfig};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::ProxyService;
pub use server::{Server, ServerError};
pub use upstream::{UpstreamClient, UpstreamTarget};
