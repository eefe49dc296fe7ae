//! The two non-final steps: `Delay` (pause before the next step) and
//! `WaitForRequestBody` (ensure the full request body has been buffered
//! before later steps, e.g. a body matcher re-check or callback, read it).

use std::time::Duration;

use super::{StepContext, StepOutcome};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct DelayStep {
    pub millis: u64,
}

impl DelayStep {
    pub fn new(millis: u64) -> Self {
        Self { millis }
    }

    pub async fn run(&self, _ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(StepOutcome::Continue)
    }
}

/// A no-op by the time it reaches the step pipeline: the server adapter
/// always buffers the full body before invoking the executor (see
/// [`crate::server`]), so this step exists for parity with the step list
/// rather than to perform any additional buffering itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitForRequestBodyStep;

impl WaitForRequestBodyStep {
    pub async fn run(&self, _ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        Ok(StepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Protocol, RequestFingerprint};
    use http::Method;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Instant;
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
    async fn test_delay_step_waits_and_continues() {
        let step = DelayStep::new(10);
        let mut r = req();
        let start = Instant::now();
        let outcome = step.run(&mut ctx(&mut r)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(matches!(outcome, StepOutcome::Continue));
    }

    #[tokio::test]
    async fn test_wait_for_request_body_continues_immediately() {
        let step = WaitForRequestBodyStep;
        let mut r = req();
        assert!(matches!(
            step.run(&mut ctx(&mut r)).await.unwrap(),
            StepOutcome::Continue
        ));
    }
}
