//! Header and cookie matchers.

use crate::matcher::core::CachedValue;
use crate::request::RequestFingerprint;

/// Matches a subset of headers: every pair given must be present (name
/// case-insensitive, value exact by default) among the request's headers.
/// Additional headers on the request that aren't named here are ignored.
#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    pairs: Vec<(String, CachedValue)>,
    case_sensitive: bool,
}

impl HeaderMatcher {
    pub fn new(pairs: Vec<(String, String)>, case_sensitive: bool) -> Self {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k, CachedValue::new(v)))
                .collect(),
            case_sensitive,
        }
    }

    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        self.pairs.iter().all(|(name, expected)| {
            req.header_values(name)
                .any(|actual| expected.equals(actual, self.case_sensitive))
        })
    }
}

/// Matches a subset of cookies by name/value, same subset semantics as headers.
#[derive(Debug, Clone)]
pub struct CookieMatcher {
    pairs: Vec<(String, String)>,
}

impl CookieMatcher {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        let cookies = req.cookies();
        self.pairs
            .iter()
            .all(|(k, v)| cookies.get(k).map(|actual| actual == v).unwrap_or(false))
    }
}
