//! Core string matching primitives shared by every matcher kind.
//!
//! `CachedValue` precomputes the lowercase form of a pattern so repeated
//! case-insensitive matches (the common case) don't re-lowercase the pattern on
//! every request. `StringMatchCore` wraps the small set of comparison kinds
//! (`equals`/`contains`/`starts_with`/`ends_with`/`regex`) that the higher-level
//! matchers (path, header, query, body) all build on.

use regex::Regex;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: String,
    pub lower: String,
}

impl CachedValue {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let lower = value.to_lowercase();
        Self { value, lower }
    }

    #[inline]
    pub fn equals(&self, other: &str, case_sensitive: bool) -> bool {
        if case_sensitive {
            other == self.value
        } else {
            other.to_lowercase() == self.lower
        }
    }

    #[inline]
    pub fn contained_in(&self, other: &str, case_sensitive: bool) -> bool {
        if case_sensitive {
            other.contains(&self.value)
        } else {
            other.to_lowercase().contains(&self.lower)
        }
    }

    #[inline]
    pub fn starts(&self, other: &str, case_sensitive: bool) -> bool {
        if case_sensitive {
            other.starts_with(&self.value)
        } else {
            other.to_lowercase().starts_with(&self.lower)
        }
    }

    #[inline]
    pub fn ends(&self, other: &str, case_sensitive: bool) -> bool {
        if case_sensitive {
            other.ends_with(&self.value)
        } else {
            other.to_lowercase().ends_with(&self.lower)
        }
    }
}

impl From<String> for CachedValue {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for CachedValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Shared string-comparison kinds reused by path/header/query/body matchers.
#[derive(Debug, Clone)]
pub enum StringMatchCore {
    Equals(CachedValue),
    Contains(CachedValue),
    StartsWith(CachedValue),
    EndsWith(CachedValue),
    Regex(Arc<Regex>),
}

impl StringMatchCore {
    pub fn equals(value: impl Into<String>) -> Self {
        Self::Equals(CachedValue::new(value))
    }

    pub fn contains(value: impl Into<String>) -> Self {
        Self::Contains(CachedValue::new(value))
    }

    pub fn starts_with(value: impl Into<String>) -> Self {
        Self::StartsWith(CachedValue::new(value))
    }

    pub fn ends_with(value: impl Into<String>) -> Self {
        Self::EndsWith(CachedValue::new(value))
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Regex(Arc::new(Regex::new(pattern)?)))
    }

    /// `case_sensitive` is ignored for `Regex`: case sensitivity there lives in
    /// the pattern itself (`(?i)`).
    pub fn matches(&self, value: &str, case_sensitive: bool) -> bool {
        match self {
            Self::Equals(c) => c.equals(value, case_sensitive),
            Self::Contains(c) => c.contained_in(value, case_sensitive),
            Self::StartsWith(c) => c.starts(value, case_sensitive),
            Self::EndsWith(c) => c.ends(value, case_sensitive),
            Self::Regex(re) => re.is_match(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_value_equals_case_insensitive() {
        let cv = CachedValue::new("Test");
        assert!(cv.equals("test", false));
        assert!(!cv.equals("test", true));
    }

    #[test]
    fn test_string_match_core_contains() {
        let m = StringMatchCore::contains("api");
        assert!(m.matches("/api/users", true));
        assert!(!m.matches("/API/users", true));
        assert!(m.matches("/API/users", false));
    }

    #[test]
    fn test_string_match_core_regex() {
        let m = StringMatchCore::regex(r"^/users/\d+$").unwrap();
        assert!(m.matches("/users/42", true));
        assert!(!m.matches("/users/abc", true));
    }
}
