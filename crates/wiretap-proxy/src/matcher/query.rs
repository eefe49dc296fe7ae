//! Query string matchers: exact full-query equality and subset matching.

use std::collections::HashMap;

use crate::request::RequestFingerprint;

/// Matches only if the query string is exactly this set of pairs, order
/// notwithstanding, with no extra parameters present on the request.
#[derive(Debug, Clone)]
pub struct ExactQueryMatcher(pub Vec<(String, String)>);

impl ExactQueryMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        let actual = req.query_pairs();
        if actual.len() != self.0.len() {
            return false;
        }
        as_multimap(&actual) == as_multimap(&self.0)
    }
}

/// Matches if the request's query string is a superset of these pairs.
#[derive(Debug, Clone)]
pub struct QueryMatcher(pub Vec<(String, String)>);

impl QueryMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        let actual = as_multimap(&req.query_pairs());
        self.0.iter().all(|(k, v)| {
            actual
                .get(k)
                .map(|values| values.contains(v))
                .unwrap_or(false)
        })
    }
}

fn as_multimap(pairs: &[(String, String)]) -> HashMap<&str, Vec<&str>> {
    let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
    for (k, v) in pairs {
        map.entry(k.as_str()).or_default().push(v.as_str());
    }
    map
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
    fn test_exact_query_matcher() {
        let m = ExactQueryMatcher(vec![("a".into(), "1".into())]);
        assert!(m.matches(&req("http://x/a?a=1")));
        assert!(!m.matches(&req("http://x/a?a=1&b=2")));
    }

    #[test]
    fn test_query_matcher_subset() {
        let m = QueryMatcher(vec![("a".into(), "1".into())]);
        assert!(m.matches(&req("http://x/a?a=1&b=2")));
        assert!(!m.matches(&req("http://x/a?b=2")));
    }
}
