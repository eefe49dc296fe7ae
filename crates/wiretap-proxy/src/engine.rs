//! Ties the rule set, the selector/executor pipeline, and the event bus
//! together into the single object a listener (or an embedding test) drives
//! requests through.
//!
//! `start` records where the listener ended up bound (for pass-through loop
//! detection), `add_rule`/`add_rules` validate and install rules,
//! `reset` clears the rule set without firing any events, and `stop` tears
//! down tracked listener state. The actual socket accept loop lives in
//! [`crate::server`]; this type never touches a `TcpListener` directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{AbortError, ProxyError, Result};
use crate::events::{Event, EventBus, RequestEvent, ResponseEvent};
use crate::executor::{self, ExecutionOutcome};
use crate::request::RequestFingerprint;
use crate::rule::{Rule, RuleBuilder};
use crate::selector::index::RuleIndex;
use crate::selector::{self, FallbackPolicy};
use crate::step::StepResponse;

/// Default cap on a buffered request body. Bodies larger than this are
/// rejected rather than silently truncated; a rule that genuinely needs to
/// handle a bigger upload should use a streamed pass-through instead.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// The request-handling engine: rule set, event bus, and fallback policy.
pub struct Engine {
    rules: ArcSwap<Vec<Arc<Rule>>>,
    index: ArcSwap<RuleIndex>,
    insertion_seq: AtomicU64,
    parameters: RwLock<HashMap<String, Value>>,
    events: EventBus,
    listener_addrs: RwLock<Vec<SocketAddr>>,
    debug: AtomicBool,
    fallback: RwLock<FallbackPolicy>,
    max_body_bytes: usize,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(Vec::new()),
            index: ArcSwap::from_pointee(RuleIndex::new()),
            insertion_seq: AtomicU64::new(0),
            parameters: RwLock::new(HashMap::new()),
            events: EventBus::new(),
            listener_addrs: RwLock::new(Vec::new()),
            debug: AtomicBool::new(false),
            fallback: RwLock::new(FallbackPolicy::default()),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_fallback(fallback: FallbackPolicy) -> Self {
        let engine = Self::new();
        *engine.fallback.write() = fallback;
        engine
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }

    pub fn set_parameter(&self, key: impl Into<String>, value: Value) {
        self.parameters.write().insert(key.into(), value);
    }

    pub fn parameter(&self, key: &str) -> Option<Value> {
        self.parameters.read().get(key).cloned()
    }

    /// Records a listener address for the pass-through subsystem's loop
    /// detection. Called by [`crate::server`] once a socket is bound.
    pub fn start(&self, addr: SocketAddr) {
        self.listener_addrs.write().push(addr);
    }

    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.listener_addrs.read().clone()
    }

    /// Closes out tracked listener state. Does not itself close any socket
    /// — that's the listener's responsibility once it sees this return —
    /// it just stops this engine believing those addresses are its own for
    /// loop-detection purposes.
    pub fn stop(&self) {
        self.listener_addrs.write().clear();
    }

    /// A read-only snapshot of the currently installed rules, in insertion
    /// order. Selection always runs against one such snapshot so a
    /// concurrent `add_rule` never produces a torn read.
    pub fn rules(&self) -> Arc<Vec<Arc<Rule>>> {
        self.rules.load_full()
    }

    fn next_insertion_seq(&self) -> u64 {
        self.insertion_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn rebuild_index(&self) {
        self.index.store(Arc::new(selector::build_index(&self.rules.load())));
    }

    /// Validates and installs a single rule, returning the constructed
    /// `Rule` so the caller can hold onto it (e.g. to `subscribe_next_match`
    /// before traffic starts flowing).
    pub fn add_rule(&self, builder: RuleBuilder) -> Result<Arc<Rule>> {
        let rule = Arc::new(builder.build(self.next_insertion_seq())?);
        self.rules.rcu(|current| {
            let mut next = (**current).clone();
            next.push(rule.clone());
            next
        });
        self.rebuild_index();
        crate::metrics::ACTIVE_RULES.set(self.rules.load().len() as i64);
        Ok(rule)
    }

    /// Validates and installs several rules atomically from the caller's
    /// point of view (no request can observe only half of them). If `reset`
    /// is set, the existing rule set is cleared first.
    pub fn add_rules(&self, builders: Vec<RuleBuilder>, reset: bool) -> Result<Vec<Arc<Rule>>> {
        if reset {
            self.reset();
        }
        let mut built = Vec::with_capacity(builders.len());
        for builder in builders {
            built.push(Arc::new(builder.build(self.next_insertion_seq())?));
        }
        let to_install = built.clone();
        self.rules.rcu(move |current| {
            let mut next = (**current).clone();
            next.extend(to_install.clone());
            next
        });
        self.rebuild_index();
        crate::metrics::ACTIVE_RULES.set(self.rules.load().len() as i64);
        Ok(built)
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut removed = false;
        self.rules.rcu(|current| {
            let mut next = (**current).clone();
            let before = next.len();
            next.retain(|r| r.id != rule_id);
            removed = next.len() != before;
            next
        });
        self.rebuild_index();
        crate::metrics::ACTIVE_RULES.set(self.rules.load().len() as i64);
        removed
    }

    /// Clears every rule and drops any pending recorded-request futures
    /// (by dropping the rules that owned them). Fires no events.
    pub fn reset(&self) {
        self.rules.store(Arc::new(Vec::new()));
        self.index.store(Arc::new(RuleIndex::new()));
        crate::metrics::ACTIVE_RULES.set(0);
    }

    /// Selects a rule for `req` and runs its pipeline, publishing the
    /// `request`/`response`/`abort` events as it goes. Falls back to
    /// [`FallbackPolicy`] when no rule matches.
    pub async fn dispatch(&self, req: &mut RequestFingerprint) -> Result<ExecutionOutcome> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.events.publish(Event::Request(RequestEvent {
            request_id: request_id.clone(),
            method: req.method.to_string(),
            url: req.url.to_string(),
        }));

        let started = std::time::Instant::now();
        let rules = self.rules();

        if self.is_debug() && req.header("x-wiretap-debug").is_some() {
            return Ok(ExecutionOutcome::Response(self.debug_report(&rules, req).await?));
        }

        let index = self.index.load_full();
        let winner = selector::select(&rules, &index, req).await?;

        let outcome = match winner {
            Some(rule) => {
                let rule = rule.clone();
                let result = executor::execute(&rule, req, self.is_debug()).await;
                crate::metrics::REQUESTS_TOTAL
                    .with_label_values(&[req.method.as_str(), "matched"])
                    .inc();
                crate::metrics::RULES_MATCHED_TOTAL
                    .with_label_values(&[&rule.id])
                    .inc();
                match &result {
                    Ok(outcome) => {
                        self.events.publish(Event::Response(ResponseEvent {
                            request_id: request_id.clone(),
                            rule_id: Some(rule.id.clone()),
                            status: outcome_status(outcome),
                            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                        }));
                    }
                    Err(ProxyError::Abort(abort)) => {
                        crate::events::tag_and_publish_abort(
                            &self.events,
                            req,
                            &request_id,
                            Some(&rule.id),
                            abort.kind,
                        );
                    }
                    Err(e) => {
                        req.tag(e.tag());
                    }
                }
                result
            }
            None => {
                crate::metrics::REQUESTS_TOTAL
                    .with_label_values(&[req.method.as_str(), "fallback"])
                    .inc();
                self.run_fallback(req).await
            }
        };

        outcome
    }

    /// Answers a request carrying `X-Wiretap-Debug` with a JSON report of how
    /// selection would have gone, instead of actually running a pipeline.
    /// Gated on [`Engine::is_debug`] so this introspection surface is opt-in.
    async fn debug_report(&self, rules: &[Arc<Rule>], req: &RequestFingerprint) -> Result<StepResponse> {
        let mut rule_reports = Vec::with_capacity(rules.len());
        for rule in rules {
            rule_reports.push(serde_json::json!({
                "id": rule.id,
                "priority": rule.priority,
                "matched": rule.matches(req).await?,
                "eligible": rule.is_eligible(),
                "match_count": rule.match_count(),
            }));
        }

        let index = self.index.load_full();
        let winner = selector::select(rules, &index, req).await?;

        let report = serde_json::json!({
            "method": req.method.to_string(),
            "url": req.url.to_string(),
            "winner": winner.map(|r| r.id.clone()),
            "rules": rule_reports,
        });

        StepResponse::json(200, &report).map_err(|e| ProxyError::Validation(e.to_string()))
    }

    async fn run_fallback(&self, _req: &mut RequestFingerprint) -> Result<ExecutionOutcome> {
        match &*self.fallback.read() {
            FallbackPolicy::PassThrough => {
                let cfg = crate::step::PassThroughStep::default();
                Ok(ExecutionOutcome::PassThrough(cfg))
            }
            FallbackPolicy::UnmatchedRequest => Ok(ExecutionOutcome::Response(
                StepResponse::new(503)
                    .with_header("content-type", "text/plain")
                    .with_body("No rule was found matching this request"),
            )),
            FallbackPolicy::Close => Err(ProxyError::Abort(AbortError::close())),
        }
    }
}

fn outcome_status(outcome: &ExecutionOutcome) -> u16 {
    match outcome {
        ExecutionOutcome::Response(resp) => resp.status,
        ExecutionOutcome::Stream(resp) => resp.status,
        // Pass-through and WebSocket-only outcomes don't have a status yet
        // at this point; 0 is a sentinel the event consumer should treat as
        // "unknown/streaming".
        ExecutionOutcome::PassThrough(_)
        | ExecutionOutcome::WsPassThrough(_)
        | ExecutionOutcome::WsEcho(_)
        | ExecutionOutcome::WsListen(_)
        | ExecutionOutcome::WsReject(_) => 0,
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Matcher;
    use crate::request::{Body, Protocol};
    use crate::step::{FixedResponseStep, Step};
    use http::Method;
    use std::net::{IpAddr, Ipv4Addr};
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
    async fn test_add_rule_and_dispatch() {
        let engine = Engine::new();
        engine
            .add_rule(
                Rule::builder()
                    .matcher(Matcher::Wildcard)
                    .step(Step::FixedResponse(FixedResponseStep::new(201))),
            )
            .unwrap();

        let mut r = req();
        match engine.dispatch(&mut r).await.unwrap() {
            ExecutionOutcome::Response(resp) => assert_eq!(resp.status, 201),
            _ => panic!("expected Response"),
        }
    }

    #[tokio::test]
    async fn test_no_rules_falls_back_to_passthrough() {
        let engine = Engine::new();
        let mut r = req();
        match engine.dispatch(&mut r).await.unwrap() {
            ExecutionOutcome::PassThrough(_) => {}
            _ => panic!("expected PassThrough fallback"),
        }
    }

    #[tokio::test]
    async fn test_unmatched_request_fallback_policy() {
        let engine = Engine::with_fallback(FallbackPolicy::UnmatchedRequest);
        let mut r = req();
        match engine.dispatch(&mut r).await.unwrap() {
            ExecutionOutcome::Response(resp) => assert_eq!(resp.status, 503),
            _ => panic!("expected fixed response"),
        }
    }

    #[tokio::test]
    async fn test_close_fallback_policy_aborts() {
        let engine = Engine::with_fallback(FallbackPolicy::Close);
        let mut r = req();
        let err = engine.dispatch(&mut r).await.unwrap_err();
        assert!(matches!(err, ProxyError::Abort(_)));
    }

    #[tokio::test]
    async fn test_reset_clears_rules() {
        let engine = Engine::new();
        engine
            .add_rule(
                Rule::builder()
                    .matcher(Matcher::Wildcard)
                    .step(Step::FixedResponse(FixedResponseStep::new(200))),
            )
            .unwrap();
        assert_eq!(engine.rules().len(), 1);
        engine.reset();
        assert_eq!(engine.rules().len(), 0);
    }

    #[tokio::test]
    async fn test_remove_rule() {
        let engine = Engine::new();
        let rule = engine
            .add_rule(
                Rule::builder()
                    .id("r1")
                    .matcher(Matcher::Wildcard)
                    .step(Step::FixedResponse(FixedResponseStep::new(200))),
            )
            .unwrap();
        assert!(engine.remove_rule(&rule.id));
        assert_eq!(engine.rules().len(), 0);
    }
}
