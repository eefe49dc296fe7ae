//! Path and URL matchers: a flexible-equality path match, a full-regex path
//! match, and a full-regex match over the whole URL string.

use crate::matcher::core::{CachedValue, StringMatchCore};
use crate::request::RequestFingerprint;

/// Matches a request path with trailing-slash and percent-encoding tolerance,
/// the way most HTTP test doubles treat `/a/b` and `/a/b/` as equivalent.
#[derive(Debug, Clone)]
pub struct FlexiblePathMatcher {
    path: CachedValue,
    case_sensitive: bool,
}

impl FlexiblePathMatcher {
    pub fn new(path: impl Into<String>, case_sensitive: bool) -> Self {
        Self {
            path: CachedValue::new(normalize(&path.into())),
            case_sensitive,
        }
    }

    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        let candidate = normalize(req.url.path());
        self.path.equals(&candidate, self.case_sensitive)
    }

    /// The normalized literal path this matcher was built with, used by the
    /// selector's rule index to build a fast-path routing key.
    pub fn literal_path(&self) -> &str {
        &self.path.value
    }
}

fn normalize(path: &str) -> String {
    let decoded = percent_decode(path);
    if decoded.len() > 1 && decoded.ends_with('/') {
        decoded[..decoded.len() - 1].to_string()
    } else {
        decoded
    }
}

fn percent_decode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&path[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| path.to_string())
}

#[derive(Debug, Clone)]
pub struct RegexPathMatcher(pub StringMatchCore);

impl RegexPathMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self(StringMatchCore::regex(pattern)?))
    }

    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        self.0.matches(req.url.path(), true)
    }
}

#[derive(Debug, Clone)]
pub struct RegexUrlMatcher(pub StringMatchCore);

impl RegexUrlMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self(StringMatchCore::regex(pattern)?))
    }

    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        self.0.matches(req.url.as_str(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Protocol};
    use http::Method;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use url::Url;

    fn req(url: &str) -> RequestFingerprint {
        RequestFingerprint::new(
            Method::GET,
            Url::parse(url).unwrap(),
            Protocol::Http,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1),
            vec![],
            false,
            Body::empty(),
        )
    }

    #[test]
    fn test_flexible_path_ignores_trailing_slash() {
        let m = FlexiblePathMatcher::new("/api/users", true);
        assert!(m.matches(&req("http://x/api/users")));
        assert!(m.matches(&req("http://x/api/users/")));
        assert!(!m.matches(&req("http://x/api/user")));
    }

    #[test]
    fn test_regex_path_matcher() {
        let m = RegexPathMatcher::new(r"^/users/\d+$").unwrap();
        assert!(m.matches(&req("http://x/users/42")));
        assert!(!m.matches(&req("http://x/users/abc")));
    }

    #[test]
    fn test_regex_url_matcher_sees_query() {
        let m = RegexUrlMatcher::new(r"\?debug=true$").unwrap();
        assert!(m.matches(&req("http://x/a?debug=true")));
        assert!(!m.matches(&req("http://x/a?debug=false")));
    }
}
