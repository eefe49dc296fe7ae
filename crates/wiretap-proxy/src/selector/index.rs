//! Fast candidate narrowing ahead of full matcher evaluation.
//!
//! With many registered rules, evaluating every matcher on every rule for
//! every request gets expensive. `RuleIndex` does a cheap first pass: rules
//! whose first matcher is a [`Matcher::Method`](crate::matcher::Matcher::Method)
//! or [`Matcher::FlexiblePath`](crate::matcher::Matcher::FlexiblePath) get
//! indexed by a radix trie keyed on method+path, so a request only pays full
//! predicate evaluation for rules that could plausibly match. Everything
//! else (regex matchers, header/body matchers, wildcards) falls into an
//! "always scan" bucket, same as the reference rule index's `any_path_rules`.
//!
//! This is an optimization only: `RuleIndex::candidates` never needs to be
//! exhaustive in the other direction — over-including a rule just costs an
//! extra (cheap) full match; under-including one would be a correctness bug,
//! so every ambiguous matcher shape routes to the always-scan bucket.

use std::collections::HashMap;

use matchit::Router;

use crate::matcher::Matcher;

/// A lookup key combining method and normalized path, used as the radix
/// trie's route pattern.
fn route_key(method: &http::Method, path: &str) -> String {
    format!("{method}{path}")
}

#[derive(Default)]
pub struct RuleIndex {
    /// method+path → rule indices, populated only for rules whose leading
    /// matchers are `Method` + `FlexiblePath` with a literal (non-templated)
    /// path.
    exact_router: Router<Vec<usize>>,
    /// Every rule that didn't fit the fast path; always fully evaluated.
    always_scan: Vec<usize>,
    len: usize,
}

impl RuleIndex {
    pub fn new() -> Self {
        Self {
            exact_router: Router::new(),
            always_scan: Vec::new(),
            len: 0,
        }
    }

    /// Rebuilds the index from scratch for the current rule list. Called
    /// whenever the engine's rule set changes; cheap enough (a handful of
    /// matchers per rule) to not warrant incremental updates.
    pub fn build(rules: &[(usize, &[Matcher])]) -> Self {
        let mut index = Self::new();
        let mut exact: HashMap<String, Vec<usize>> = HashMap::new();

        for (rule_idx, matchers) in rules {
            index.len += 1;
            match fast_path_key(matchers) {
                Some(key) => exact.entry(key).or_default().push(*rule_idx),
                None => index.always_scan.push(*rule_idx),
            }
        }

        for (key, rule_indices) in exact {
            // matchit requires routes to start with `/`; our keys are
            // `<METHOD><path>` so we insert them relative to a synthetic root.
            let route = format!("/{key}");
            let _ = index.exact_router.insert(route, rule_indices);
        }

        index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Candidate rule indices for a request: the union of the always-scan
    /// bucket and whatever the trie matched for this method+path, in no
    /// particular order. Duplicates are possible and harmless — the caller
    /// runs full matcher evaluation regardless.
    pub fn candidates(&self, method: &http::Method, path: &str) -> Vec<usize> {
        let mut out = self.always_scan.clone();
        let route = format!("/{}", route_key(method, path));
        if let Ok(matched) = self.exact_router.at(&route) {
            out.extend(matched.value.iter().copied());
        }
        out
    }
}

/// Only rules carrying both an exact `Method` matcher and a literal
/// `FlexiblePath` matcher get a fast-path key; anything else (wildcards,
/// regex paths, header-only rules) must be scanned on every request.
fn fast_path_key(matchers: &[Matcher]) -> Option<String> {
    let method = matchers.iter().find_map(|m| match m {
        Matcher::Method(inner) => Some(inner.0.clone()),
        _ => None,
    })?;
    let path = matchers.iter().find_map(|m| match m {
        Matcher::FlexiblePath(inner) => Some(inner.literal_path().to_string()),
        _ => None,
    })?;
    Some(route_key(&method, &path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_index() {
        let index = RuleIndex::build(&[]);
        assert!(index.is_empty());
        assert!(index.candidates(&http::Method::GET, "/a").is_empty());
    }

    #[test]
    fn test_rules_without_fast_path_always_scanned() {
        let matchers = vec![Matcher::Wildcard];
        let rules: Vec<(usize, &[Matcher])> = vec![(0, &matchers)];
        let index = RuleIndex::build(&rules);
        assert_eq!(index.len(), 1);
        assert_eq!(index.candidates(&http::Method::GET, "/anything"), vec![0]);
    }

    #[test]
    fn test_method_and_path_rule_gets_fast_path() {
        let matchers = vec![
            Matcher::method(http::Method::GET),
            Matcher::flexible_path("/users", true),
        ];
        let rules: Vec<(usize, &[Matcher])> = vec![(0, &matchers)];
        let index = RuleIndex::build(&rules);
        assert_eq!(
            index.candidates(&http::Method::GET, "/users"),
            vec![0]
        );
        assert!(index
            .candidates(&http::Method::POST, "/users")
            .is_empty());
    }
}
