//! A `Rule` is the unit of configuration: a set of matchers, a step pipeline,
//! and a completion policy, identified by a stable id and ordered by priority
//! and insertion order.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;

use crate::completion::{CompletionChecker, MatchCounter};
use crate::error::{ProxyError, Result};
use crate::matcher::{matches_all, Matcher};
use crate::request::RequestFingerprint;
use crate::step::Step;

/// Priority a rule gets when none is given explicitly. `0` is reserved as the
/// fallback-only tier and is never assigned by default.
pub const DEFAULT_PRIORITY: u32 = 1;

/// Snapshot handed to anything awaiting "rule X has now matched a request",
/// e.g. an admin client blocked on a recorded-future subscription.
#[derive(Debug, Clone)]
pub struct CompletedRequest {
    pub rule_id: String,
    pub match_count: u64,
    pub matched_at_unix_ms: u128,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body_len: usize,
}

/// An ordered matcher list, a step pipeline, and a completion policy, with the
/// bookkeeping (match counter, recorded-future waiters) the selector and
/// executor need at runtime.
pub struct Rule {
    pub id: String,
    pub priority: u32,
    pub matchers: Vec<Matcher>,
    pub steps: Vec<Step>,
    /// `None` means the rule was registered without an explicit completion
    /// checker — the "null" completion state: such a rule never formally
    /// completes, but once it has matched at least once it is deprioritized
    /// below any rule in the same priority
    /// group that still has a strictly-incomplete checker. See
    /// [`crate::selector`] for how this plays out during selection.
    pub completion: Option<CompletionChecker>,
    match_count: MatchCounter,
    /// Admin clients can subscribe to "next time this rule matches" by
    /// registering a sender here; the executor fires every pending sender
    /// once per completed match, then clears the list.
    waiters: Mutex<Vec<oneshot::Sender<CompletedRequest>>>,
    insertion_seq: u64,
}

impl Rule {
    pub fn builder() -> RuleBuilder {
        RuleBuilder::new()
    }

    pub fn match_count(&self) -> u64 {
        self.match_count.get()
    }

    pub fn insertion_seq(&self) -> u64 {
        self.insertion_seq
    }

    /// Whether the rule's completion policy still allows it to win selection
    /// at all (distinct from the null-vs-strictly-incomplete preference the
    /// selector applies among eligible rules — see [`crate::selector`]).
    /// A rule with no explicit checker is always eligible; a rule with a
    /// bounded checker is eligible until its match count reaches the limit.
    pub fn is_eligible(&self) -> bool {
        match &self.completion {
            Some(checker) => checker.is_eligible(self.match_count.get()),
            None => true,
        }
    }

    /// The "null" completion state: no explicit checker was configured,
    /// but the rule has matched at least once already.
    pub fn is_null_state(&self) -> bool {
        self.completion.is_none() && self.match_count.get() > 0
    }

    /// Evaluates every matcher against `req`; all must match.
    pub async fn matches(&self, req: &RequestFingerprint) -> Result<bool> {
        matches_all(&self.matchers, req).await
    }

    /// Registers a waiter that resolves the next time this rule completes a
    /// match. Used by the channel's "wait for rule" RPC.
    pub fn subscribe_next_match(&self) -> oneshot::Receiver<CompletedRequest> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().expect("rule waiters mutex poisoned").push(tx);
        rx
    }

    /// Called by the executor once a request has been fully handled by this
    /// rule: bumps the match counter and notifies any recorded-future
    /// waiters with the headers and body length actually observed on the
    /// wire for this request.
    pub fn record_match(&self, req: &RequestFingerprint) -> u64 {
        let count = self.match_count.increment();
        let completed = CompletedRequest {
            rule_id: self.id.clone(),
            match_count: count,
            matched_at_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0),
            method: req.method.to_string(),
            url: req.url.to_string(),
            headers: req.raw_headers.clone(),
            body_len: req.body.len(),
        };
        let waiters = std::mem::take(&mut *self.waiters.lock().expect("rule waiters mutex poisoned"));
        for waiter in waiters {
            let _ = waiter.send(completed.clone());
        }
        count
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("matchers", &self.matchers.len())
            .field("steps", &self.steps.len())
            .field("completion", &self.completion)
            .field("match_count", &self.match_count())
            .finish()
    }
}

/// Construction-time validator for [`Rule`]. Catches the invariants that
/// can't be expressed in the type system: at least one matcher, at least one
/// step, and every step but the last must be non-final.
pub struct RuleBuilder {
    id: Option<String>,
    priority: u32,
    matchers: Vec<Matcher>,
    steps: Vec<Step>,
    completion: Option<CompletionChecker>,
}

impl RuleBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            priority: DEFAULT_PRIORITY,
            matchers: Vec::new(),
            steps: Vec::new(),
            completion: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn matchers(mut self, matchers: Vec<Matcher>) -> Self {
        self.matchers = matchers;
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn completion(mut self, completion: CompletionChecker) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Validates and constructs the `Rule`. `insertion_seq` should be a
    /// monotonically increasing counter supplied by the
    /// [`Engine`](crate::engine::Engine) so FIFO tie-breaking in the selector
    /// has a stable order independent of wall-clock timestamps.
    pub fn build(self, insertion_seq: u64) -> Result<Rule> {
        if self.matchers.is_empty() {
            return Err(ProxyError::NoMatcher);
        }
        if self.steps.is_empty() {
            return Err(ProxyError::NoStep);
        }
        let last = self.steps.len() - 1;
        for (index, step) in self.steps.iter().enumerate() {
            if index != last && step.is_final() {
                return Err(ProxyError::FinalStepNotLast {
                    index,
                    kind: step.kind().as_str(),
                });
            }
            step.validate()?;
        }

        Ok(Rule {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            priority: self.priority,
            matchers: self.matchers,
            steps: self.steps,
            completion: self.completion,
            match_count: MatchCounter::new(),
            waiters: Mutex::new(Vec::new()),
            insertion_seq,
        })
    }
}

impl Default for RuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Protocol};
    use crate::step::FixedResponseStep;
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

    #[test]
    fn test_build_requires_at_least_one_matcher() {
        let result = Rule::builder()
            .step(Step::FixedResponse(FixedResponseStep::new(200)))
            .build(0);
        assert!(matches!(result, Err(ProxyError::NoMatcher)));
    }

    #[test]
    fn test_build_requires_at_least_one_step() {
        let result = Rule::builder().matcher(Matcher::Wildcard).build(0);
        assert!(matches!(result, Err(ProxyError::NoStep)));
    }

    #[test]
    fn test_build_rejects_non_last_final_step() {
        let result = Rule::builder()
            .matcher(Matcher::Wildcard)
            .step(Step::FixedResponse(FixedResponseStep::new(200)))
            .step(Step::FixedResponse(FixedResponseStep::new(201)))
            .build(0);
        assert!(matches!(
            result,
            Err(ProxyError::FinalStepNotLast { index: 0, .. })
        ));
    }

    #[test]
    fn test_build_succeeds_with_valid_rule() {
        let rule = Rule::builder()
            .matcher(Matcher::Wildcard)
            .step(Step::FixedResponse(FixedResponseStep::new(200)))
            .build(0)
            .unwrap();
        assert!(rule.is_eligible());
        assert_eq!(rule.match_count(), 0);
    }

    #[tokio::test]
    async fn test_record_match_increments_and_notifies_waiters() {
        let rule = Rule::builder()
            .matcher(Matcher::Wildcard)
            .step(Step::FixedResponse(FixedResponseStep::new(200)))
            .build(0)
            .unwrap();
        let waiter = rule.subscribe_next_match();
        rule.record_match(&req());
        assert_eq!(rule.match_count(), 1);
        let completed = waiter.await.unwrap();
        assert_eq!(completed.rule_id, rule.id);
        assert_eq!(completed.match_count, 1);
    }

    #[test]
    fn test_once_completion_exhausts_eligibility() {
        let rule = Rule::builder()
            .matcher(Matcher::Wildcard)
            .step(Step::FixedResponse(FixedResponseStep::new(200)))
            .completion(CompletionChecker::Once)
            .build(0)
            .unwrap();
        assert!(rule.is_eligible());
        rule.record_match(&req());
        assert!(!rule.is_eligible());
    }
}
