//! Connection-termination and hang steps: `CloseConnection`, `ResetConnection`,
//! and `Timeout`.

use super::{StepContext, StepOutcome};
use crate::error::{AbortError, ProxyError, Result};

/// Closes the TCP connection cleanly (FIN) without writing a response.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseConnectionStep;

impl CloseConnectionStep {
    pub async fn run(&self, _ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        Err(ProxyError::Abort(AbortError::close()))
    }
}

/// Resets the TCP connection (RST) without writing a response.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetConnectionStep;

impl ResetConnectionStep {
    pub async fn run(&self, _ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        Err(ProxyError::Abort(AbortError::reset()))
    }
}

/// Never responds; holds the connection open until the client gives up or
/// the transport's own idle timeout fires. Modeled as an indefinite sleep so
/// the executor's cancellation (client disconnect) can still interrupt it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutStep;

impl TimeoutStep {
    pub async fn run(&self, _ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        std::future::pending::<()>().await;
        unreachable!("pending future never resolves")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AbortKind;
    use crate::request::{Body, Protocol, RequestFingerprint};
    use http::Method;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use url::Url;

    fn ctx(req: &mut RequestFingerprint) -> StepContext<'_> {
        StepContext {
            request: req,
            rule_id: "rule-1",
            debug: false,
        }
    }

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
    async fn test_close_connection_aborts() {
        let mut r = req();
        let err = CloseConnectionStep.run(&mut ctx(&mut r)).await.unwrap_err();
        match err {
            ProxyError::Abort(e) => assert_eq!(e.kind, AbortKind::Close),
            _ => panic!("expected Abort"),
        }
    }

    #[tokio::test]
    async fn test_reset_connection_aborts() {
        let mut r = req();
        let err = ResetConnectionStep.run(&mut ctx(&mut r)).await.unwrap_err();
        match err {
            ProxyError::Abort(e) => assert_eq!(e.kind, AbortKind::Reset),
            _ => panic!("expected Abort"),
        }
    }
}
