//! Body matchers: raw bytes, regex over text, JSON (exact and flexible
//! subset), form fields, and multipart field presence.

use serde_json::Value;

use crate::matcher::core::StringMatchCore;
use crate::request::RequestFingerprint;

#[derive(Debug, Clone)]
pub struct RawBodyMatcher(pub Vec<u8>);

impl RawBodyMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        req.body.raw().as_ref() == self.0.as_slice()
    }
}

#[derive(Debug, Clone)]
pub struct RawBodyIncludesMatcher(pub Vec<u8>);

impl RawBodyIncludesMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        contains_subslice(req.body.raw().as_ref(), &self.0)
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[derive(Debug, Clone)]
pub struct RegexBodyMatcher(pub StringMatchCore);

impl RegexBodyMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self(StringMatchCore::regex(pattern)?))
    }

    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        match req.body.as_text() {
            Ok(text) => self.0.matches(text, true),
            Err(_) => false,
        }
    }
}

/// Matches only if the request body, parsed as JSON, is deep-equal to this
/// value (object key order and array contents must match exactly).
#[derive(Debug, Clone)]
pub struct JsonBodyMatcher(pub Value);

impl JsonBodyMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        match req.body.as_json() {
            Ok(actual) => actual == &self.0,
            Err(_) => false,
        }
    }
}

/// Matches if the request body, parsed as JSON, contains this value as a
/// subset: every key present in the pattern must be present and equal in the
/// request body, extra keys on the request are ignored. Applies recursively
/// to nested objects; arrays must match exactly where compared.
#[derive(Debug, Clone)]
pub struct JsonBodyFlexibleMatcher(pub Value);

impl JsonBodyFlexibleMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        match req.body.as_json() {
            Ok(actual) => is_subset(&self.0, actual),
            Err(_) => false,
        }
    }
}

fn is_subset(pattern: &Value, actual: &Value) -> bool {
    match (pattern, actual) {
        (Value::Object(pat_map), Value::Object(actual_map)) => pat_map.iter().all(|(k, v)| {
            actual_map
                .get(k)
                .map(|actual_v| is_subset(v, actual_v))
                .unwrap_or(false)
        }),
        (Value::Array(pat_arr), Value::Array(actual_arr)) => {
            pat_arr.len() == actual_arr.len()
                && pat_arr
                    .iter()
                    .zip(actual_arr.iter())
                    .all(|(p, a)| is_subset(p, a))
        }
        _ => pattern == actual,
    }
}

/// Matches if every given field is present with this exact value among the
/// request's `application/x-www-form-urlencoded` fields.
#[derive(Debug, Clone)]
pub struct FormDataMatcher(pub Vec<(String, String)>);

impl FormDataMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        let Ok(fields) = req.body.as_form() else {
            return false;
        };
        self.0.iter().all(|(k, v)| {
            fields
                .iter()
                .any(|(fk, fv)| fk == k && fv == v)
        })
    }
}

/// Matches if every named multipart field is present, optionally with an
/// exact text value.
#[derive(Debug, Clone)]
pub struct MultipartFormMatcher(pub Vec<(String, Option<String>)>);

impl MultipartFormMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        let Ok(parts) = req.body.as_multipart() else {
            return false;
        };
        self.0.iter().all(|(name, expected_value)| {
            parts.iter().any(|part| {
                part.name == *name
                    && expected_value
                        .as_ref()
                        .map(|v| part.data.as_ref() == v.as_bytes())
                        .unwrap_or(true)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Protocol};
    use bytes::Bytes;
    use http::Method;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use url::Url;

    fn req_with_body(body: Body) -> RequestFingerprint {
        RequestFingerprint::new(
            Method::POST,
            Url::parse("http://x/a").unwrap(),
            Protocol::Http,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1),
            vec![],
            false,
            body,
        )
    }

    #[test]
    fn test_raw_body_matcher_exact() {
        let m = RawBodyMatcher(b"hello".to_vec());
        assert!(m.matches(&req_with_body(Body::new(Bytes::from_static(b"hello"), None))));
        assert!(!m.matches(&req_with_body(Body::new(Bytes::from_static(b"world"), None))));
    }

    #[test]
    fn test_raw_body_includes() {
        let m = RawBodyIncludesMatcher(b"ell".to_vec());
        assert!(m.matches(&req_with_body(Body::new(Bytes::from_static(b"hello"), None))));
    }

    #[test]
    fn test_json_body_exact() {
        let m = JsonBodyMatcher(json!({"a": 1}));
        assert!(m.matches(&req_with_body(Body::new(
            Bytes::from_static(br#"{"a":1}"#),
            None
        ))));
        assert!(!m.matches(&req_with_body(Body::new(
            Bytes::from_static(br#"{"a":1,"b":2}"#),
            None
        ))));
    }

    #[test]
    fn test_json_body_flexible_subset() {
        let m = JsonBodyFlexibleMatcher(json!({"a": 1}));
        assert!(m.matches(&req_with_body(Body::new(
            Bytes::from_static(br#"{"a":1,"b":2}"#),
            None
        ))));
        assert!(!m.matches(&req_with_body(Body::new(
            Bytes::from_static(br#"{"a":2}"#),
            None
        ))));
    }

    #[test]
    fn test_form_data_matcher() {
        let m = FormDataMatcher(vec![("name".into(), "alice".into())]);
        assert!(m.matches(&req_with_body(Body::new(
            Bytes::from_static(b"name=alice&age=30"),
            None
        ))));
    }
}
