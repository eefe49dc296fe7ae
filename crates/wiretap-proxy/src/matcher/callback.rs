//! The escape hatch: an arbitrary predicate supplied by the admin client,
//! either as an in-process closure (when the engine is embedded directly) or
//! as a remote RPC dispatched over the [`channel`](crate::channel) duplex
//! connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::decision_cache::{fingerprint_digest, DecisionCache};
use crate::error::Result;
use crate::request::RequestFingerprint;

/// Implemented by both the local closure adapter and the channel's remote
/// dispatch stub, so `CallbackMatcher` doesn't care which one backs it.
#[async_trait]
pub trait MatchCallback: Send + Sync {
    async fn call(&self, req: &RequestFingerprint) -> Result<bool>;
}

pub struct LocalMatchCallback<F>(pub F)
where
    F: Fn(&RequestFingerprint) -> bool + Send + Sync;

#[async_trait]
impl<F> MatchCallback for LocalMatchCallback<F>
where
    F: Fn(&RequestFingerprint) -> bool + Send + Sync,
{
    async fn call(&self, req: &RequestFingerprint) -> Result<bool> {
        Ok((self.0)(req))
    }
}

#[derive(Clone)]
pub struct CallbackMatcher {
    pub callback: Arc<dyn MatchCallback>,
    /// Memoizes this instance's own answers per request digest; `None`
    /// unless the rule opted in via [`CallbackMatcher::with_decision_cache`].
    cache: Option<Arc<DecisionCache<bool>>>,
}

impl fmt::Debug for CallbackMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackMatcher").finish_non_exhaustive()
    }
}

impl CallbackMatcher {
    pub fn new(callback: Arc<dyn MatchCallback>) -> Self {
        Self {
            callback,
            cache: None,
        }
    }

    /// Memoizes this matcher's answer for identical requests (same method,
    /// URL, body) within `ttl`, so a burst of otherwise-identical requests
    /// pays the remote/user predicate's cost once. See
    /// [`crate::decision_cache`] for why this is per-instance, not global.
    pub fn with_decision_cache(mut self, ttl: Duration) -> Self {
        self.cache = Some(Arc::new(DecisionCache::new(ttl)));
        self
    }

    /// A callback that throws is treated as a non-match rather than
    /// propagated, so one misbehaving rule's predicate can't take down
    /// selection for every other rule.
    pub async fn matches(&self, req: &RequestFingerprint) -> Result<bool> {
        let digest = self.cache.as_ref().map(|_| fingerprint_digest(req));
        if let (Some(cache), Some(digest)) = (&self.cache, digest) {
            if let Some(hit) = cache.get(digest) {
                return Ok(hit);
            }
        }

        let result = match self.callback.call(req).await {
            Ok(matched) => matched,
            Err(e) => {
                tracing::warn!(error = %e, "callback matcher threw, treating as non-match");
                false
            }
        };

        if let (Some(cache), Some(digest)) = (&self.cache, digest) {
            cache.put(digest, result);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Protocol};
    use http::Method;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use url::Url;

    fn req() -> RequestFingerprint {
        RequestFingerprint::new(
            Method::GET,
            Url::parse("http://x/a").unwrap(),
            Protocol::Http,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1),
            vec![],
            false,
            Body::empty(),
        )
    }

    #[tokio::test]
    async fn test_local_callback_matcher() {
        let m = CallbackMatcher::new(Arc::new(LocalMatchCallback(|r: &RequestFingerprint| {
            r.method == Method::GET
        })));
        assert!(m.matches(&req()).await.unwrap());
    }

    #[tokio::test]
    async fn test_decision_cache_avoids_second_call() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingCallback(Arc<AtomicUsize>);
        #[async_trait]
        impl MatchCallback for CountingCallback {
            async fn call(&self, _req: &RequestFingerprint) -> Result<bool> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let m = CallbackMatcher::new(Arc::new(CountingCallback(calls.clone())))
            .with_decision_cache(Duration::from_secs(60));

        assert!(m.matches(&req()).await.unwrap());
        assert!(m.matches(&req()).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct ThrowingCallback;

    #[async_trait]
    impl MatchCallback for ThrowingCallback {
        async fn call(&self, _req: &RequestFingerprint) -> Result<bool> {
            Err(crate::error::ProxyError::CallbackThrew("boom".into()))
        }
    }

    #[tokio::test]
    async fn test_throwing_callback_is_treated_as_non_match() {
        let m = CallbackMatcher::new(Arc::new(ThrowingCallback));
        assert!(!m.matches(&req()).await.unwrap());
    }
}
