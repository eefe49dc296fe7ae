//! A tiny bounded, per-instance memoization cache for repeated callback
//! invocations against an identical request fingerprint within a short TTL
//! window.
//!
//! A callback re-evaluated many times per second against the same request
//! (e.g. a health-check hammering an endpoint a
//! `Callback` matcher/step governs) is pure waste once the first answer is
//! known. This cache is deliberately *not* a global, shared-across-rules
//! structure — each `CallbackMatcher`/`Callback` step owns one, keyed only
//! on a digest of the request it was actually asked about, so one rule's
//! cached answer can never leak into another's decision.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Bound on the number of distinct request fingerprints memoized per
/// instance; oldest-inserted entries are evicted first once exceeded. Kept
/// small since this exists to absorb bursts of identical requests, not to
/// act as a general-purpose cache.
const MAX_ENTRIES: usize = 64;

struct Entry<T> {
    value: T,
    expires_at: Instant,
    inserted_at: Instant,
}

/// Memoizes `T` (a match result or a step's response) per request digest,
/// for `ttl`. Safe to share across concurrent callers of the same callback
/// instance.
pub struct DecisionCache<T: Clone + Send> {
    ttl: Duration,
    entries: Mutex<HashMap<u64, Entry<T>>>,
}

impl<T: Clone + Send> DecisionCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value for `key` if present and unexpired.
    pub fn get(&self, key: u64) -> Option<T> {
        let entries = self.entries.lock();
        let entry = entries.get(&key)?;
        if entry.expires_at < Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Records `value` under `key`, evicting the single oldest entry first
    /// if the cache is already at [`MAX_ENTRIES`].
    pub fn put(&self, key: u64, value: T) {
        let mut entries = self.entries.lock();
        if entries.len() >= MAX_ENTRIES && !entries.contains_key(&key) {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| *k)
            {
                entries.remove(&oldest_key);
            }
        }
        let now = Instant::now();
        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
                inserted_at: now,
            },
        );
    }
}

/// Digests the observable parts of a request that a callback's outcome
/// could plausibly depend on: method, absolute URL, and the raw body bytes.
/// Headers are deliberately excluded — most callbacks key off method/URL/body
/// and including headers (which often carry per-request tracing IDs) would
/// make every request a cache miss, defeating the point.
pub fn fingerprint_digest(req: &crate::request::RequestFingerprint) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    req.method.as_str().hash(&mut hasher);
    req.url.as_str().hash(&mut hasher);
    req.body.raw().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_get_within_ttl() {
        let cache = DecisionCache::new(Duration::from_secs(60));
        cache.put(1, "result".to_string());
        assert_eq!(cache.get(1), Some("result".to_string()));
    }

    #[test]
    fn test_get_expired_returns_none() {
        let cache: DecisionCache<String> = DecisionCache::new(Duration::from_millis(0));
        cache.put(1, "result".to_string());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn test_eviction_bounds_size() {
        let cache = DecisionCache::new(Duration::from_secs(60));
        for i in 0..(MAX_ENTRIES as u64 + 10) {
            cache.put(i, i);
        }
        assert!(cache.entries.lock().len() <= MAX_ENTRIES);
    }

    #[test]
    fn test_fingerprint_digest_differs_by_url() {
        use crate::request::{Body, Protocol};
        use http::Method;
        use std::net::{IpAddr, Ipv4Addr, SocketAddr};
        use url::Url;

        let make = |url: &str| {
            crate::request::RequestFingerprint::new(
                Method::GET,
                Url::parse(url).unwrap(),
                Protocol::Http,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1),
                vec![],
                false,
                Body::empty(),
            )
        };
        assert_ne!(
            fingerprint_digest(&make("http://x/a")),
            fingerprint_digest(&make("http://x/b"))
        );
    }
}
