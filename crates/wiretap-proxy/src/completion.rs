//! Bounded match counters that retire a rule after it has fired a fixed
//! number of times.
//!
//! A rule's `CompletionChecker` is consulted by the [`selector`](crate::selector)
//! after a rule has already matched, to decide whether it is still eligible to
//! win selection given how many times it has already fired.

use std::sync::atomic::{AtomicU64, Ordering};

/// How many times a rule may still match before it is considered exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionChecker {
    /// Never exhausts; always eligible.
    Always,
    Once,
    Twice,
    Thrice,
    NTimes(u64),
}

impl CompletionChecker {
    fn limit(&self) -> Option<u64> {
        match self {
            CompletionChecker::Always => None,
            CompletionChecker::Once => Some(1),
            CompletionChecker::Twice => Some(2),
            CompletionChecker::Thrice => Some(3),
            CompletionChecker::NTimes(n) => Some(*n),
        }
    }

    /// Whether a rule that has already matched `matched_count` times is still
    /// eligible to match again.
    pub fn is_eligible(&self, matched_count: u64) -> bool {
        match self.limit() {
            None => true,
            Some(limit) => matched_count < limit,
        }
    }

    /// Whether a rule is "null-state" for selection tie-breaking purposes: a
    /// bounded checker that has been exhausted. `Always` rules are never
    /// null-state. See the selector's priority/FIFO/null-completion policy.
    pub fn is_exhausted(&self, matched_count: u64) -> bool {
        !self.is_eligible(matched_count)
    }

    pub fn explain(&self) -> String {
        match self {
            CompletionChecker::Always => "always".to_string(),
            CompletionChecker::Once => "once".to_string(),
            CompletionChecker::Twice => "twice".to_string(),
            CompletionChecker::Thrice => "thrice".to_string(),
            CompletionChecker::NTimes(n) => format!("{n} times"),
        }
    }
}

/// Thread-safe match counter a [`Rule`](crate::rule::Rule) owns alongside its
/// `CompletionChecker`.
#[derive(Debug, Default)]
pub struct MatchCounter(AtomicU64);

impl MatchCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_never_exhausted() {
        let c = CompletionChecker::Always;
        assert!(c.is_eligible(0));
        assert!(c.is_eligible(1_000_000));
    }

    #[test]
    fn test_once_exhausts_after_first_match() {
        let c = CompletionChecker::Once;
        assert!(c.is_eligible(0));
        assert!(!c.is_eligible(1));
    }

    #[test]
    fn test_n_times() {
        let c = CompletionChecker::NTimes(3);
        assert!(c.is_eligible(2));
        assert!(!c.is_eligible(3));
    }

    #[test]
    fn test_match_counter_increments() {
        let counter = MatchCounter::new();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.get(), 2);
    }
}
