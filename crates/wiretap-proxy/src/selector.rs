//! Picks the winning rule for a request out of every currently-registered
//! rule that matches it.
//!
//! Selection order:
//! 1. Only rules whose matchers all match the request are candidates.
//! 2. Candidates are grouped by `priority`; the highest-priority group that
//!    contains at least one *non-exhausted* rule wins — a rule whose
//!    completion checker has run out of matches is dropped from
//!    consideration at this stage even if its priority is highest overall.
//! 3. Within the winning group, a rule with an explicit checker that is
//!    still strictly incomplete (`is_complete() == false`) is preferred over
//!    a "null-completion" rule (no explicit checker, already matched at
//!    least once — see [`Rule::is_null_state`]). Among strictly-incomplete
//!    rules the earliest-registered (FIFO) wins; among null-completion
//!    rules the *latest*-registered wins, so re-registering an updated
//!    catch-all supersedes the old one (see `DESIGN.md`'s Open Question
//!    decisions).
//! 4. If every matching rule across every priority is exhausted, the
//!    selector still returns something rather than falling through
//!    silently: the highest-priority, latest-registered exhausted rule wins.

pub mod index;

use std::sync::Arc;

use crate::error::Result;
use crate::request::RequestFingerprint;
use crate::rule::Rule;
use index::RuleIndex;

/// What the engine should do when no rule matches at all.
#[derive(Debug, Clone)]
pub enum FallbackPolicy {
    /// Forward unmatched requests to their real destination.
    PassThrough,
    /// Answer unmatched requests with a fixed explanatory response.
    UnmatchedRequest,
    /// Abort the connection outright rather than answer it.
    Close,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy::PassThrough
    }
}

/// Evaluates every rule's matchers against `req` and returns the winner, if
/// any, per the ordering described above. `index` narrows which rules get a
/// full matcher evaluation; pass [`RuleIndex::build`]'s output rebuilt
/// whenever the engine's rule set changes.
pub async fn select<'a>(
    rules: &'a [Arc<Rule>],
    index: &RuleIndex,
    req: &RequestFingerprint,
) -> Result<Option<&'a Arc<Rule>>> {
    let candidate_indices = index.candidates(&req.method, req.url.path());
    let mut matched = Vec::new();
    for rule_idx in candidate_indices {
        let Some(rule) = rules.get(rule_idx) else { continue };
        if rule.matches(req).await? {
            matched.push(rule);
        }
    }
    matched.sort_by_key(|r| r.insertion_seq());
    matched.dedup_by_key(|r| r.insertion_seq());

    if matched.is_empty() {
        return Ok(None);
    }

    let non_exhausted: Vec<_> = matched.iter().filter(|r| r.is_eligible()).cloned().collect();

    if non_exhausted.is_empty() {
        // Every matching rule has exhausted its completion checker. Still
        // have to answer the request: highest priority, latest registered.
        return Ok(Some(pick_highest_priority(matched, false)));
    }

    let winning_priority = non_exhausted.iter().map(|r| r.priority).max().unwrap_or(0);
    let group: Vec<_> = non_exhausted
        .into_iter()
        .filter(|r| r.priority == winning_priority)
        .collect();

    let strictly_incomplete: Vec<_> = group.iter().filter(|r| !r.is_null_state()).cloned().collect();

    if !strictly_incomplete.is_empty() {
        // FIFO: earliest-registered wins.
        return Ok(Some(
            strictly_incomplete
                .into_iter()
                .min_by_key(|r| r.insertion_seq())
                .expect("non-empty"),
        ));
    }

    // Every rule in the winning group is null-completion: latest wins.
    Ok(Some(
        group
            .into_iter()
            .max_by_key(|r| r.insertion_seq())
            .expect("non-empty"),
    ))
}

/// `fifo = true` picks the earliest-inserted rule within the winning
/// priority tier; `fifo = false` picks the latest-inserted one.
fn pick_highest_priority<'a>(mut candidates: Vec<&'a Arc<Rule>>, fifo: bool) -> &'a Arc<Rule> {
    let max_priority = candidates.iter().map(|r| r.priority).max().unwrap_or(0);
    candidates.retain(|r| r.priority == max_priority);

    if fifo {
        candidates
            .into_iter()
            .min_by_key(|r| r.insertion_seq())
            .expect("candidates non-empty")
    } else {
        candidates
            .into_iter()
            .max_by_key(|r| r.insertion_seq())
            .expect("candidates non-empty")
    }
}

/// Rebuilds the fast-path index for `rules` from scratch. Kept alongside
/// `select` (rather than inlined into [`crate::engine::Engine`]) so it can
/// be exercised directly in these unit tests too.
pub fn build_index(rules: &[Arc<Rule>]) -> RuleIndex {
    let owned: Vec<(usize, &[crate::matcher::Matcher])> =
        rules.iter().enumerate().map(|(i, r)| (i, r.matchers.as_slice())).collect();
    RuleIndex::build(&owned)
}
