//! Runs a winning rule's step pipeline to completion.
//!
//! Most of the work here is bookkeeping around a single `for` loop over
//! `rule.steps`: time each step for metrics, stop at the first step that
//! produces a response (or hands off to pass-through), and record the match
//! against the rule once a terminal outcome is reached. Errors are tagged
//! with their stable string (see [`crate::error::ProxyError::tag`]) before
//! being handed back to the caller, so the server layer can attach them to
//! the request's `tags` for recorded-request introspection.

use std::time::Instant;

use crate::error::{ProxyError, Result};
use crate::request::RequestFingerprint;
use crate::rule::Rule;
use crate::step::{
    PassThroughStep, Step, StepContext, StepOutcome, StepResponse, StreamingResponse, WsEchoStep,
    WsListenStep, WsPassThroughStep, WsRejectStep,
};

/// The terminal result of running a rule's pipeline.
pub enum ExecutionOutcome {
    Response(StepResponse),
    Stream(StreamingResponse),
    /// The pipeline reached a `PassThrough` step; the caller (the server
    /// adapter) must hand the live connection to [`crate::passthrough`].
    PassThrough(PassThroughStep),
    /// As above, for an upgraded WebSocket connection.
    WsPassThrough(WsPassThroughStep),
    /// The pipeline reached a `WsEcho` step: upgrade, then bounce every
    /// downstream frame straight back.
    WsEcho(WsEchoStep),
    /// The pipeline reached a `WsListen` step: upgrade, then consume
    /// downstream frames without ever writing one back.
    WsListen(WsListenStep),
    /// The pipeline reached a `WsReject` step: answer the upgrade attempt
    /// with a fixed non-101 response, never switching protocols.
    WsReject(WsRejectStep),
}

pub async fn execute(rule: &Rule, req: &mut RequestFingerprint, debug: bool) -> Result<ExecutionOutcome> {
    let mut ctx = StepContext {
        request: req,
        rule_id: &rule.id,
        debug,
    };

    for step in &rule.steps {
        // Pass-through steps hand off the live connection rather than being
        // driven through the generic `Step::run` dispatch.
        match step {
            Step::PassThrough(cfg) => {
                rule.record_match(&*ctx.request);
                return Ok(ExecutionOutcome::PassThrough(cfg.clone()));
            }
            Step::WsPassThrough(cfg) => {
                rule.record_match(&*ctx.request);
                return Ok(ExecutionOutcome::WsPassThrough(cfg.clone()));
            }
            Step::WsEcho(cfg) => {
                rule.record_match(&*ctx.request);
                return Ok(ExecutionOutcome::WsEcho(*cfg));
            }
            Step::WsListen(cfg) => {
                rule.record_match(&*ctx.request);
                return Ok(ExecutionOutcome::WsListen(*cfg));
            }
            Step::WsReject(cfg) => {
                rule.record_match(&*ctx.request);
                return Ok(ExecutionOutcome::WsReject(cfg.clone()));
            }
            _ => {}
        }

        let started = Instant::now();
        let outcome = step.run(&mut ctx).await;
        crate::metrics::STEP_DURATION_MS
            .with_label_values(&[step.kind().as_str()])
            .observe(started.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(StepOutcome::Continue) => continue,
            Ok(StepOutcome::Respond(resp)) => {
                rule.record_match(&*ctx.request);
                notify_response_webhooks(rule, resp.status);
                return Ok(ExecutionOutcome::Response(resp));
            }
            Ok(StepOutcome::RespondStream(resp)) => {
                rule.record_match(&*ctx.request);
                notify_response_webhooks(rule, resp.status);
                return Ok(ExecutionOutcome::Stream(resp));
            }
            Ok(StepOutcome::HandedOff) => {
                // Only reachable if a pass-through step's `run` is invoked
                // directly instead of through the match arm above; treat it
                // the same as reaching the end of the pipeline with no
                // response, since the caller didn't get a hand-off value.
                return Err(ProxyError::InvalidRule(
                    "pass-through step produced no routable hand-off".into(),
                ));
            }
            Err(e) => {
                crate::metrics::PASSTHROUGH_ERRORS_TOTAL
                    .with_label_values(&[&e.tag()])
                    .inc();
                return Err(e);
            }
        }
    }

    Err(ProxyError::InvalidRule(format!(
        "rule {} exhausted its step pipeline without producing a response",
        rule.id
    )))
}

/// Fires any `Webhook` step's `response` notification once a rule's
/// pipeline has produced its terminal status. `Webhook` steps never see the
/// eventual response themselves (they run earlier, non-final, in the
/// pipeline), so the executor closes that loop here.
fn notify_response_webhooks(rule: &Rule, status: u16) {
    for step in &rule.steps {
        if let Step::Webhook(webhook) = step {
            webhook.notify_response(&rule.id, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Matcher;
    use crate::request::{Body, Protocol};
    use crate::step::{DelayStep, FixedResponseStep};
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
    async fn test_execute_runs_delay_then_responds() {
        let rule = Rule::builder()
            .matcher(Matcher::Wildcard)
            .step(Step::Delay(DelayStep::new(1)))
            .step(Step::FixedResponse(FixedResponseStep::new(204)))
            .build(0)
            .unwrap();
        let mut r = req();
        match execute(&rule, &mut r, false).await.unwrap() {
            ExecutionOutcome::Response(resp) => assert_eq!(resp.status, 204),
            _ => panic!("expected Response"),
        }
        assert_eq!(rule.match_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_pipeline_without_terminal_step_errors() {
        let rule = Rule::builder()
            .matcher(Matcher::Wildcard)
            .step(Step::Delay(DelayStep::new(1)))
            .build(0)
            .unwrap();
        let mut r = req();
        assert!(execute(&rule, &mut r, false).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_ws_reject_hands_off_without_running_as_a_plain_step() {
        let rule = Rule::builder()
            .matcher(Matcher::Wildcard)
            .step(Step::WsReject(crate::step::WsRejectStep::new(401).with_header("WWW-Authenticate", "Basic")))
            .build(0)
            .unwrap();
        let mut r = req();
        match execute(&rule, &mut r, false).await.unwrap() {
            ExecutionOutcome::WsReject(reject) => assert_eq!(reject.status, 401),
            _ => panic!("expected WsReject"),
        }
        assert_eq!(rule.match_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_propagates_abort() {
        let rule = Rule::builder()
            .matcher(Matcher::Wildcard)
            .step(Step::CloseConnection(crate::step::CloseConnectionStep))
            .build(0)
            .unwrap();
        let mut r = req();
        let err = execute(&rule, &mut r, false).await.unwrap_err();
        assert!(matches!(err, ProxyError::Abort(_)));
    }
}
