//! Matchers over request-line and connection-level fields: method, host,
//! hostname, port, and protocol.

use http::Method;

use crate::request::{Protocol, RequestFingerprint};

#[derive(Debug, Clone)]
pub struct MethodMatcher(pub Method);

impl MethodMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        req.method == self.0
    }
}

/// Matches the `host` portion of the target URL including an explicit port,
/// e.g. `example.com:8080`. Comparison is case-insensitive, per RFC 3986 host
/// case-folding rules.
#[derive(Debug, Clone)]
pub struct HostMatcher(pub String);

impl HostMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        req.host_with_explicit_port()
            .map(|h| h.eq_ignore_ascii_case(&self.0))
            .unwrap_or(false)
    }
}

/// Matches only the hostname, ignoring any port.
#[derive(Debug, Clone)]
pub struct HostnameMatcher(pub String);

impl HostnameMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        req.url
            .host_str()
            .map(|h| h.eq_ignore_ascii_case(&self.0))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct PortMatcher(pub u16);

impl PortMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        req.url.port_or_known_default() == Some(self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolMatcher(pub Protocol);

impl ProtocolMatcher {
    pub fn matches(&self, req: &RequestFingerprint) -> bool {
        req.protocol == self.0
    }
}
