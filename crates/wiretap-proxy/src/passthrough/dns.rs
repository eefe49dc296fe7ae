//! A small, process-wide cache for the two DNS-adjacent lookups pass-through
//! actually needs: a `localhost` address-family probe (does the loopback
//! target answer on `::1` or only `127.0.0.1`?) and a short hostname→IP
//! cache for repeat upstream dials.
//!
//! This deliberately does not reimplement a DNS client. `lookup_options`
//! (explicit `servers`, custom `maxTtl`/`errorTtl`) is accepted on
//! [`LookupOptions`] for wire-format compatibility, but resolution is always
//! delegated to the OS resolver via [`tokio::net::lookup_host`] — only the
//! cache TTLs honor the configured values. See `DESIGN.md` for why: adding a
//! full DNS client (e.g. `hickory-resolver`) pulls in a dependency nothing
//! else in this stack uses, for a feature whose default (cache the system
//! resolver's answer) already covers the common case.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Per-rule DNS policy, mirroring spec §4.4 step 7's `lookupOptions`.
#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub max_ttl: Duration,
    pub error_ttl: Duration,
    pub servers: Vec<SocketAddr>,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self {
            max_ttl: DEFAULT_TTL,
            error_ttl: Duration::from_secs(1),
            servers: Vec::new(),
        }
    }
}

/// The engine-wide fallback cache lifetime when a rule sets no
/// `lookupOptions`: "a process-wide 10s hostname cache" (spec §4.4 step 7,
/// §9).
const DEFAULT_TTL: Duration = Duration::from_secs(10);

#[derive(Clone)]
enum Entry {
    Ok(Vec<IpAddr>),
    Err,
}

struct CacheEntry {
    value: Entry,
    expires_at: Instant,
}

/// Caches hostname resolutions and `localhost` address-family probes for the
/// lifetime of the engine.
#[derive(Default)]
pub struct DnsCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `host` to its address list, using `opts`' TTLs (or the
    /// 10s default) to decide how long a hit stays warm.
    pub async fn resolve(&self, host: &str, opts: Option<&LookupOptions>) -> std::io::Result<Vec<IpAddr>> {
        let max_ttl = opts.map(|o| o.max_ttl).unwrap_or(DEFAULT_TTL);
        let error_ttl = opts.map(|o| o.error_ttl).unwrap_or(Duration::from_secs(1));

        if let Some(hit) = self.cached(host) {
            return hit;
        }

        let result = tokio::net::lookup_host((host, 0))
            .await
            .map(|addrs| addrs.map(|a| a.ip()).collect::<Vec<_>>());

        let entry = match &result {
            Ok(addrs) => CacheEntry {
                value: Entry::Ok(addrs.clone()),
                expires_at: Instant::now() + max_ttl,
            },
            Err(_) => CacheEntry {
                value: Entry::Err,
                expires_at: Instant::now() + error_ttl,
            },
        };
        self.entries.lock().insert(host.to_string(), entry);
        result
    }

    fn cached(&self, host: &str) -> Option<std::io::Result<Vec<IpAddr>>> {
        let entries = self.entries.lock();
        let entry = entries.get(host)?;
        if entry.expires_at < Instant::now() {
            return None;
        }
        Some(match &entry.value {
            Entry::Ok(addrs) => Ok(addrs.clone()),
            Entry::Err => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "cached DNS failure")),
        })
    }

    /// Implements spec §4.4 step 6: probe `::1` then `127.0.0.1` on `port`
    /// and return whichever address accepts a TCP connection, caching the
    /// winner for `DEFAULT_TTL` so repeated `localhost` targets on the same
    /// port don't re-probe every request.
    pub async fn probe_localhost(&self, port: u16) -> IpAddr {
        let cache_key = format!("__localhost_probe__:{port}");
        if let Some(Ok(addrs)) = self.cached(&cache_key) {
            if let Some(addr) = addrs.first() {
                return *addr;
            }
        }

        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port);
        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let winner = if tokio::net::TcpStream::connect(v6).await.is_ok() {
            v6.ip()
        } else {
            v4.ip()
        };

        self.entries.lock().insert(
            cache_key,
            CacheEntry {
                value: Entry::Ok(vec![winner]),
                expires_at: Instant::now() + DEFAULT_TTL,
            },
        );
        winner
    }
}

/// True for the handful of spellings a request URL or `Host` header might
/// use to mean "this machine".
pub fn is_localhost(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || host == "::1"
        || host == "[::1]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_caches_hit() {
        let cache = DnsCache::new();
        let first = cache.resolve("localhost", None).await.unwrap();
        assert!(!first.is_empty());
        let second = cache.cached("localhost").unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_is_localhost_variants() {
        assert!(is_localhost("localhost"));
        assert!(is_localhost("LOCALHOST"));
        assert!(is_localhost("127.0.0.1"));
        assert!(is_localhost("::1"));
        assert!(!is_localhost("example.com"));
    }

    #[tokio::test]
    async fn test_probe_localhost_returns_loopback_address() {
        let cache = DnsCache::new();
        let addr = cache.probe_localhost(1).await;
        assert!(addr.is_loopback());
    }
}
