//! `Callback` step: hand the request to user code (local closure or remote
//! RPC over the admin channel) and use whatever response it returns.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{StepContext, StepOutcome, StepResponse};
use crate::decision_cache::{fingerprint_digest, DecisionCache};
use crate::error::{AbortError, Result};

/// A callback's reply: either a concrete response, or a request to abort the
/// connection outright (mirrors the `CloseConnection`/`ResetConnection` steps
/// but decided dynamically by the callback).
#[derive(Clone)]
pub enum CallbackReply {
    Response(StepResponse),
    Abort(AbortError),
}

#[async_trait]
pub trait RespondCallback: Send + Sync {
    async fn call(&self, ctx: &mut StepContext<'_>) -> Result<CallbackReply>;
}

pub struct LocalRespondCallback<F>(pub F)
where
    F: Fn(&RequestFingerprintRef) -> CallbackReply + Send + Sync;

// `RequestFingerprintRef` keeps the closure signature readable without
// borrowing `StepContext` directly; it's just `&RequestFingerprint`.
pub type RequestFingerprintRef = crate::request::RequestFingerprint;

#[async_trait]
impl<F> RespondCallback for LocalRespondCallback<F>
where
    F: Fn(&RequestFingerprintRef) -> CallbackReply + Send + Sync,
{
    async fn call(&self, ctx: &mut StepContext<'_>) -> Result<CallbackReply> {
        Ok((self.0)(ctx.request))
    }
}

pub struct CallbackStep {
    pub callback: Arc<dyn RespondCallback>,
    /// See [`crate::decision_cache`]; `None` unless the rule opted in via
    /// [`CallbackStep::with_decision_cache`].
    cache: Option<Arc<DecisionCache<CallbackReply>>>,
}

impl fmt::Debug for CallbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackStep").finish_non_exhaustive()
    }
}

impl CallbackStep {
    pub fn new(callback: Arc<dyn RespondCallback>) -> Self {
        Self {
            callback,
            cache: None,
        }
    }

    /// Memoizes this step's reply for identical requests within `ttl`.
    pub fn with_decision_cache(mut self, ttl: Duration) -> Self {
        self.cache = Some(Arc::new(DecisionCache::new(ttl)));
        self
    }

    pub async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        let digest = self.cache.as_ref().map(|_| fingerprint_digest(ctx.request));
        if let (Some(cache), Some(digest)) = (&self.cache, digest) {
            if let Some(hit) = cache.get(digest) {
                return match hit {
                    CallbackReply::Response(resp) => Ok(StepOutcome::Respond(resp)),
                    CallbackReply::Abort(err) => Err(err.into()),
                };
            }
        }

        let reply = self.callback.call(ctx).await?;
        if let (Some(cache), Some(digest)) = (&self.cache, digest) {
            cache.put(digest, reply.clone());
        }
        match reply {
            CallbackReply::Response(resp) => Ok(StepOutcome::Respond(resp)),
            CallbackReply::Abort(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Protocol, RequestFingerprint};
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
    async fn test_local_callback_step_returns_response() {
        let step = CallbackStep::new(Arc::new(LocalRespondCallback(|_req| {
            CallbackReply::Response(StepResponse::new(201))
        })));
        let mut r = req();
        let mut ctx = StepContext {
            request: &mut r,
            rule_id: "rule-1",
            debug: false,
        };
        match step.run(&mut ctx).await.unwrap() {
            StepOutcome::Respond(resp) => assert_eq!(resp.status, 201),
            _ => panic!("expected Respond"),
        }
    }

    #[tokio::test]
    async fn test_decision_cache_avoids_second_call() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingCallback(Arc<AtomicUsize>);
        #[async_trait]
        impl RespondCallback for CountingCallback {
            async fn call(&self, _ctx: &mut StepContext<'_>) -> Result<CallbackReply> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(CallbackReply::Response(StepResponse::new(200)))
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let step = CallbackStep::new(Arc::new(CountingCallback(calls.clone())))
            .with_decision_cache(Duration::from_secs(60));

        let mut r = req();
        let mut ctx = StepContext {
            request: &mut r,
            rule_id: "rule-1",
            debug: false,
        };
        step.run(&mut ctx).await.unwrap();
        step.run(&mut ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_callback_step_can_abort() {
        let step = CallbackStep::new(Arc::new(LocalRespondCallback(|_req| {
            CallbackReply::Abort(AbortError::reset())
        })));
        let mut r = req();
        let mut ctx = StepContext {
            request: &mut r,
            rule_id: "rule-1",
            debug: false,
        };
        assert!(step.run(&mut ctx).await.is_err());
    }
}
