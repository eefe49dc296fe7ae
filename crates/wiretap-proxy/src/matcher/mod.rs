//! Request matchers: pure predicates evaluated against a [`RequestFingerprint`].
//!
//! A [`Rule`](crate::rule::Rule) carries a list of matchers; all of them must
//! match for the rule to be a selection candidate (see [`matches_all`]).
//! Every matcher but [`Matcher::Callback`] is a synchronous, side-effect-free
//! predicate; `Callback` alone may cross an RPC boundary and is therefore the
//! one variant evaluated with an `await`.

pub mod basic;
pub mod body;
pub mod callback;
pub mod core;
pub mod header;
pub mod path;
pub mod query;

use serde_json::Value;

use crate::error::Result;
use crate::request::{Protocol, RequestFingerprint};

use basic::{HostMatcher, HostnameMatcher, MethodMatcher, PortMatcher, ProtocolMatcher};
use body::{
    FormDataMatcher, JsonBodyFlexibleMatcher, JsonBodyMatcher, MultipartFormMatcher,
    RawBodyIncludesMatcher, RawBodyMatcher, RegexBodyMatcher,
};
use callback::CallbackMatcher;
use header::{CookieMatcher, HeaderMatcher};
use path::{FlexiblePathMatcher, RegexPathMatcher, RegexUrlMatcher};
use query::{ExactQueryMatcher, QueryMatcher};

/// A single predicate over an in-flight request.
///
/// Construction-time validation (e.g. regex compilation) happens in each
/// submodule's constructor; by the time a `Matcher` exists it is ready to
/// evaluate without further fallibility, except for `Callback`, whose remote
/// dispatch can fail independently per call.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Matches every request. Used for catch-all fallback rules.
    Wildcard,
    Method(MethodMatcher),
    Host(HostMatcher),
    Hostname(HostnameMatcher),
    Port(PortMatcher),
    Protocol(ProtocolMatcher),
    FlexiblePath(FlexiblePathMatcher),
    RegexPath(RegexPathMatcher),
    RegexUrl(RegexUrlMatcher),
    Header(HeaderMatcher),
    Cookie(CookieMatcher),
    ExactQuery(ExactQueryMatcher),
    Query(QueryMatcher),
    FormData(FormDataMatcher),
    MultipartForm(MultipartFormMatcher),
    RawBody(RawBodyMatcher),
    RawBodyIncludes(RawBodyIncludesMatcher),
    RegexBody(RegexBodyMatcher),
    JsonBody(JsonBodyMatcher),
    JsonBodyFlexible(JsonBodyFlexibleMatcher),
    Callback(CallbackMatcher),
}

impl Matcher {
    pub fn method(method: http::Method) -> Self {
        Matcher::Method(MethodMatcher(method))
    }

    pub fn host(host: impl Into<String>) -> Self {
        Matcher::Host(HostMatcher(host.into()))
    }

    pub fn hostname(hostname: impl Into<String>) -> Self {
        Matcher::Hostname(HostnameMatcher(hostname.into()))
    }

    pub fn port(port: u16) -> Self {
        Matcher::Port(PortMatcher(port))
    }

    pub fn protocol(protocol: Protocol) -> Self {
        Matcher::Protocol(ProtocolMatcher(protocol))
    }

    pub fn flexible_path(path: impl Into<String>, case_sensitive: bool) -> Self {
        Matcher::FlexiblePath(FlexiblePathMatcher::new(path, case_sensitive))
    }

    pub fn regex_path(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Matcher::RegexPath(RegexPathMatcher::new(pattern)?))
    }

    pub fn regex_url(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Matcher::RegexUrl(RegexUrlMatcher::new(pattern)?))
    }

    pub fn header(pairs: Vec<(String, String)>, case_sensitive: bool) -> Self {
        Matcher::Header(HeaderMatcher::new(pairs, case_sensitive))
    }

    pub fn cookie(pairs: Vec<(String, String)>) -> Self {
        Matcher::Cookie(CookieMatcher::new(pairs))
    }

    pub fn exact_query(pairs: Vec<(String, String)>) -> Self {
        Matcher::ExactQuery(ExactQueryMatcher(pairs))
    }

    pub fn query(pairs: Vec<(String, String)>) -> Self {
        Matcher::Query(QueryMatcher(pairs))
    }

    pub fn form_data(pairs: Vec<(String, String)>) -> Self {
        Matcher::FormData(FormDataMatcher(pairs))
    }

    pub fn multipart_form(fields: Vec<(String, Option<String>)>) -> Self {
        Matcher::MultipartForm(MultipartFormMatcher(fields))
    }

    pub fn raw_body(bytes: Vec<u8>) -> Self {
        Matcher::RawBody(RawBodyMatcher(bytes))
    }

    pub fn raw_body_includes(bytes: Vec<u8>) -> Self {
        Matcher::RawBodyIncludes(RawBodyIncludesMatcher(bytes))
    }

    pub fn regex_body(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Matcher::RegexBody(RegexBodyMatcher::new(pattern)?))
    }

    pub fn json_body(value: Value) -> Self {
        Matcher::JsonBody(JsonBodyMatcher(value))
    }

    pub fn json_body_flexible(value: Value) -> Self {
        Matcher::JsonBodyFlexible(JsonBodyFlexibleMatcher(value))
    }

    /// Human-readable label used in rule explanations and debug introspection.
    pub fn kind(&self) -> &'static str {
        match self {
            Matcher::Wildcard => "wildcard",
            Matcher::Method(_) => "method",
            Matcher::Host(_) => "host",
            Matcher::Hostname(_) => "hostname",
            Matcher::Port(_) => "port",
            Matcher::Protocol(_) => "protocol",
            Matcher::FlexiblePath(_) => "flexible-path",
            Matcher::RegexPath(_) => "regex-path",
            Matcher::RegexUrl(_) => "regex-url",
            Matcher::Header(_) => "header",
            Matcher::Cookie(_) => "cookie",
            Matcher::ExactQuery(_) => "exact-query",
            Matcher::Query(_) => "query",
            Matcher::FormData(_) => "form-data",
            Matcher::MultipartForm(_) => "multipart-form",
            Matcher::RawBody(_) => "raw-body",
            Matcher::RawBodyIncludes(_) => "raw-body-includes",
            Matcher::RegexBody(_) => "regex-body",
            Matcher::JsonBody(_) => "json-body",
            Matcher::JsonBodyFlexible(_) => "json-body-flexible",
            Matcher::Callback(_) => "callback",
        }
    }

    /// Evaluates this single matcher against `req`. Only `Callback` can fail
    /// or cross an await point; every other variant is infallible.
    pub async fn matches(&self, req: &RequestFingerprint) -> Result<bool> {
        Ok(match self {
            Matcher::Wildcard => true,
            Matcher::Method(m) => m.matches(req),
            Matcher::Host(m) => m.matches(req),
            Matcher::Hostname(m) => m.matches(req),
            Matcher::Port(m) => m.matches(req),
            Matcher::Protocol(m) => m.matches(req),
            Matcher::FlexiblePath(m) => m.matches(req),
            Matcher::RegexPath(m) => m.matches(req),
            Matcher::RegexUrl(m) => m.matches(req),
            Matcher::Header(m) => m.matches(req),
            Matcher::Cookie(m) => m.matches(req),
            Matcher::ExactQuery(m) => m.matches(req),
            Matcher::Query(m) => m.matches(req),
            Matcher::FormData(m) => m.matches(req),
            Matcher::MultipartForm(m) => m.matches(req),
            Matcher::RawBody(m) => m.matches(req),
            Matcher::RawBodyIncludes(m) => m.matches(req),
            Matcher::RegexBody(m) => m.matches(req),
            Matcher::JsonBody(m) => m.matches(req),
            Matcher::JsonBodyFlexible(m) => m.matches(req),
            Matcher::Callback(m) => return m.matches(req).await,
        })
    }
}

/// Every matcher in `matchers` must match for the rule to be a candidate.
/// Short-circuits on the first non-match, left to right, so cheap matchers
/// (method, host) should be listed before expensive ones (regex body,
/// callback) — the selector's rule index already reorders the cheap
/// structural checks ahead of this full evaluation, see [`crate::selector`].
pub async fn matches_all(matchers: &[Matcher], req: &RequestFingerprint) -> Result<bool> {
    for matcher in matchers {
        if !matcher.matches(req).await? {
            return Ok(false);
        }
    }
    Ok(true)
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

    #[tokio::test]
    async fn test_matches_all_short_circuits() {
        let matchers = vec![
            Matcher::method(Method::GET),
            Matcher::regex_path(r"^/nope$").unwrap(),
        ];
        assert!(!matches_all(&matchers, &req("http://x/a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_matches_all_wildcard() {
        let matchers = vec![Matcher::Wildcard];
        assert!(matches_all(&matchers, &req("http://x/anything"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_matches_all_empty_is_vacuously_true() {
        assert!(matches_all(&[], &req("http://x/a")).await.unwrap());
    }
}
