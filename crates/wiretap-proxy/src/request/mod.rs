//! Read-only view of an in-flight request, and the lazily-decoded body capability
//! object that backs several matchers and the recorded-request snapshot.

mod body;

pub use body::Body;

use std::collections::HashMap;
use std::net::SocketAddr;

use http::{HeaderMap, Method};
use url::Url;

/// Protocol the request arrived over, as observed by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
    Ws,
    Wss,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Protocol::Https | Protocol::Wss)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            "ws" => Some(Protocol::Ws),
            "wss" => Some(Protocol::Wss),
            _ => None,
        }
    }
}

/// Read-only fingerprint of an in-flight request, as consumed by matchers, steps,
/// and the pass-through subsystem.
///
/// Header pairs are kept in both raw (ordered, duplicate-preserving) form and as a
/// typed `HeaderMap` for transport code; matchers that need case-insensitive
/// subset checks use `headers()`, while the pass-through layer that needs to
/// faithfully forward every repeated header uses `raw_headers`.
#[derive(Debug, Clone)]
pub struct RequestFingerprint {
    pub method: Method,
    pub url: Url,
    pub protocol: Protocol,
    pub remote_addr: SocketAddr,
    pub raw_headers: Vec<(String, String)>,
    pub is_h2: bool,
    pub body: Body,
    /// Mutated by the engine to annotate observed errors (`passthrough-error:...`);
    /// matchers must treat this as read-only.
    pub tags: Vec<String>,
}

impl RequestFingerprint {
    pub fn new(
        method: Method,
        url: Url,
        protocol: Protocol,
        remote_addr: SocketAddr,
        raw_headers: Vec<(String, String)>,
        is_h2: bool,
        body: Body,
    ) -> Self {
        Self {
            method,
            url,
            protocol,
            remote_addr,
            raw_headers,
            is_h2,
            body,
            tags: Vec::new(),
        }
    }

    /// `host` including port iff the URL carried an explicit port.
    pub fn host_with_explicit_port(&self) -> Option<String> {
        let host = self.url.host_str()?;
        match self.url.port() {
            Some(port) if self.url.port_or_known_default() == Some(port) && explicit_port(&self.url) => {
                Some(format!("{host}:{port}"))
            }
            _ => Some(host.to_string()),
        }
    }

    /// Case-insensitive header lookup returning the first match, mirroring how
    /// HTTP implementations treat repeated headers for single-value lookups.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.raw_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for a given header name, case-insensitive, in wire order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.raw_headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Typed header map view, built on demand for code that wants `http::HeaderMap`
    /// ergonomics (hyper request construction, pass-through).
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in &self.raw_headers {
            if let (Ok(name), Ok(value)) = (
                http::HeaderName::from_bytes(k.as_bytes()),
                http::HeaderValue::from_str(v),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    /// Parses the `Cookie` header(s) into a flat `k -> v` map, last-token-wins on
    /// duplicate keys (matches how most HTTP stacks merge repeated cookie pairs).
    pub fn cookies(&self) -> HashMap<String, String> {
        let mut cookies = HashMap::new();
        for value in self.header_values("cookie") {
            for pair in value.split(';') {
                if let Some((k, v)) = pair.split_once('=') {
                    cookies.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }
        cookies
    }

    /// Parsed query parameters as a multi-map (a key may appear more than once).
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    pub fn tag(&mut self, tag: impl Into<String>) {
        self.tags.push(tag.into());
    }
}

fn explicit_port(url: &Url) -> bool {
    // `Url::port()` already returns `None` when the port matches the scheme's
    // default and was not given explicitly in most constructions, but requests
    // rebuilt from raw header data may carry an explicit default port (e.g.
    // `Host: example.com:443` over https) that `url::Url` normalizes away. We
    // treat any `Some(port)` from a URL parsed with `Url::set_port` explicitly
    // called as explicit; callers that need the Host-header-exact value should
    // prefer `raw_headers` directly.
    url.port().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9999)
    }

    fn fingerprint(url: &str, headers: Vec<(&str, &str)>) -> RequestFingerprint {
        RequestFingerprint::new(
            Method::GET,
            Url::parse(url).unwrap(),
            Protocol::Http,
            addr(),
            headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            false,
            Body::empty(),
        )
    }

    #[test]
    fn test_header_case_insensitive() {
        let req = fingerprint("http://example.com/a", vec![("Content-Type", "text/plain")]);
        assert_eq!(req.header("content-type"), Some("text/plain"));
    }

    #[test]
    fn test_header_values_preserves_duplicates() {
        let req = fingerprint(
            "http://example.com/a",
            vec![("X-Tag", "a"), ("x-tag", "b")],
        );
        let values: Vec<_> = req.header_values("X-Tag").collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn test_cookies_parses_multiple_pairs() {
        let req = fingerprint(
            "http://example.com/a",
            vec![("Cookie", "a=1; b=2")],
        );
        let cookies = req.cookies();
        assert_eq!(cookies.get("a"), Some(&"1".to_string()));
        assert_eq!(cookies.get("b"), Some(&"2".to_string()));
    }

    #[test]
    fn test_query_pairs() {
        let req = fingerprint("http://example.com/a?x=1&y=2", vec![]);
        let pairs = req.query_pairs();
        assert_eq!(
            pairs,
            vec![("x".to_string(), "1".to_string()), ("y".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn test_tag_appends() {
        let mut req = fingerprint("http://example.com/a", vec![]);
        req.tag("passthrough-error:ECONNRESET");
        assert_eq!(req.tags, vec!["passthrough-error:ECONNRESET".to_string()]);
    }
}
