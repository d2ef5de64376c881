//! Process configuration from environment variables.
//!
//! Every knob is a `RECAP_*` variable. Unlike a best-effort service, a proxy
//! with a half-parsed configuration must not start: any missing required
//! value or unparseable number is a fatal [`ConfigError`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::upstream::UpstreamTarget;

/// Errors detected while loading configuration. All are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {name}")]
    Missing { name: &'static str },

    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Runtime configuration for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_port: u16,
    pub upstream: UpstreamTarget,
    pub cache_dir: PathBuf,
    pub cache_max_size_bytes: u64,
    pub cache_default_ttl_secs: u64,
    pub max_concurrent_requests: usize,
    pub upstream_timeout: Duration,
    /// How long past expiry an entry may still be served when the upstream
    /// is unreachable. Zero disables stale-on-error serving.
    pub stale_if_error_secs: u64,
}

impl ProxyConfig {
    const DEFAULT_LISTEN_PORT: u16 = 80;
    const DEFAULT_CACHE_DIR: &'static str = "./cache";
    const DEFAULT_CACHE_MAX_SIZE_BYTES: u64 = 1024 * 1024 * 1024; // 1 GiB
    const DEFAULT_CACHE_TTL_SECS: u64 = 300;
    const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;
    const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
    const DEFAULT_STALE_IF_ERROR_SECS: u64 = 86_400;

    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup, so tests
    /// can exercise parsing without mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let upstream_host = lookup("RECAP_UPSTREAM_HOST").ok_or(ConfigError::Missing {
            name: "RECAP_UPSTREAM_HOST",
        })?;
        let upstream_port: u16 = require_parsed(&lookup, "RECAP_UPSTREAM_PORT")?;

        Ok(Self {
            listen_port: parsed_or(&lookup, "RECAP_LISTEN_PORT", Self::DEFAULT_LISTEN_PORT)?,
            upstream: UpstreamTarget::new(upstream_host, upstream_port),
            cache_dir: lookup("RECAP_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CACHE_DIR)),
            cache_max_size_bytes: parsed_or(
                &lookup,
                "RECAP_CACHE_MAX_SIZE_BYTES",
                Self::DEFAULT_CACHE_MAX_SIZE_BYTES,
            )?,
            cache_default_ttl_secs: parsed_or(
                &lookup,
                "RECAP_CACHE_DEFAULT_TTL_SECS",
                Self::DEFAULT_CACHE_TTL_SECS,
            )?,
            max_concurrent_requests: parsed_or(
                &lookup,
                "RECAP_MAX_CONCURRENT_REQUESTS",
                Self::DEFAULT_MAX_CONCURRENT_REQUESTS,
            )?,
            upstream_timeout: Duration::from_secs(parsed_or(
                &lookup,
                "RECAP_UPSTREAM_TIMEOUT_SECS",
                Self::DEFAULT_UPSTREAM_TIMEOUT_SECS,
            )?),
            stale_if_error_secs: parsed_or(
                &lookup,
                "RECAP_STALE_IF_ERROR_SECS",
                Self::DEFAULT_STALE_IF_ERROR_SECS,
            )?,
        })
    }

    /// The socket address the listener binds.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }
}

fn parsed_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            reason: "not a valid number",
        }),
    }
}

fn require_parsed<F, T>(lookup: &F, name: &'static str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let value = lookup(name).ok_or(ConfigError::Missing { name })?;
    value.parse().map_err(|_| ConfigError::Invalid {
        name,
        value,
        reason: "not a valid number",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = ProxyConfig::from_lookup(lookup(&[
            ("RECAP_UPSTREAM_HOST", "app"),
            ("RECAP_UPSTREAM_PORT", "5000"),
        ]))
        .unwrap();

        assert_eq!(cfg.listen_port, 80);
        assert_eq!(cfg.upstream.host(), "app");
        assert_eq!(cfg.upstream.port(), 5000);
        assert_eq!(cfg.cache_max_size_bytes, 1024 * 1024 * 1024);
        assert_eq!(cfg.cache_default_ttl_secs, 300);
        assert_eq!(cfg.max_concurrent_requests, 256);
        assert_eq!(cfg.stale_if_error_secs, 86_400);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:80");
    }

    #[test]
    fn missing_upstream_is_fatal() {
        let err = ProxyConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing {
                name: "RECAP_UPSTREAM_HOST"
            }
        ));
    }

    #[test]
    fn missing_upstream_port_is_fatal() {
        let err =
            ProxyConfig::from_lookup(lookup(&[("RECAP_UPSTREAM_HOST", "app")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing {
                name: "RECAP_UPSTREAM_PORT"
            }
        ));
    }

    #[test]
    fn unparseable_number_is_fatal_not_defaulted() {
        let err = ProxyConfig::from_lookup(lookup(&[
            ("RECAP_UPSTREAM_HOST", "app"),
            ("RECAP_UPSTREAM_PORT", "5000"),
            ("RECAP_LISTEN_PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "RECAP_LISTEN_PORT",
                ..
            }
        ));
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg = ProxyConfig::from_lookup(lookup(&[
            ("RECAP_UPSTREAM_HOST", "app"),
            ("RECAP_UPSTREAM_PORT", "5000"),
            ("RECAP_LISTEN_PORT", "8080"),
            ("RECAP_CACHE_DIR", "/var/cache/recap"),
            ("RECAP_CACHE_MAX_SIZE_BYTES", "4096"),
            ("RECAP_CACHE_DEFAULT_TTL_SECS", "60"),
            ("RECAP_MAX_CONCURRENT_REQUESTS", "16"),
            ("RECAP_UPSTREAM_TIMEOUT_SECS", "5"),
            ("RECAP_STALE_IF_ERROR_SECS", "0"),
        ]))
        .unwrap();

        assert_eq!(cfg.listen_port, 8080);
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/cache/recap"));
        assert_eq!(cfg.cache_max_size_bytes, 4096);
        assert_eq!(cfg.cache_default_ttl_secs, 60);
        assert_eq!(cfg.max_concurrent_requests, 16);
        assert_eq!(cfg.upstream_timeout, Duration::from_secs(5));
        assert_eq!(cfg.stale_if_error_secs, 0);
    }
}
