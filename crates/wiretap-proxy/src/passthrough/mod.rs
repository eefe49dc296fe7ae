//! Forwards a request to its real upstream destination and relays the
//! response back verbatim, for rules using the `PassThrough`/`WsPassThrough`
//! steps.
//!
//! The HTTP path follows the numbered algorithm from the project design
//! docs:
//!
//! 1. [`target::resolve`] — compute the absolute upstream URI.
//! 2. [`target::would_loop`] — refuse to forward back into our own listener.
//! 3. [`transform_request`] — strip hop-by-hop headers, apply the rule's
//!    request transform hook.
//! 4. [`tls::client_config_for_host`] — TLS policy (verify vs. `NoVerifier`)
//!    keyed by the rule's `ignore_host_https_errors` list.
//! 5. HTTP version negotiation — ALPN picks h2 vs. http/1.1; hop downgrade
//!    to h1 against upstreams that don't speak h2 is handled by the
//!    connector.
//! 6. Localhost family fix — [`dns::DnsCache::probe_localhost`] tries `::1`
//!    then `127.0.0.1` on the target port and caches whichever one actually
//!    accepted a connection.
//! 7. [`dns::DnsCache`] — a process-wide ~10s hostname cache; see its module
//!    docs for why it caches the OS resolver's answer rather than
//!    reimplementing a DNS client.
//! 8. Upstream proxy resolution — honors `HTTPS_PROXY`/`HTTP_PROXY` via
//!    [`upstream_proxy::from_env`] when set.
//! 9. Send the request.
//! 10. Relay the response headers/body back unchanged.
//! 11. [`classify_error`] — map transport failures to the stable error tags.
//! 12. Abort coupling — `CloseConnection`/`ResetConnection` observed as the
//!     *response* to a pass-through (rather than a step in the rule itself)
//!     surface as [`crate::error::AbortError`] so the caller tears down the
//!     downstream connection instead of writing a half response.

pub mod dns;
pub mod target;
pub mod tls;
pub mod transform;
pub mod upstream_proxy;
pub mod websocket;

use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::{AbortError, ProxyError, Result};
use crate::request::RequestFingerprint;
use crate::step::{BeforeRequestOutcome, BeforeResponseOutcome, PassThroughStep, StepResponse};

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Drops hop-by-hop headers before forwarding, per RFC 7230 §6.1. Rules may
/// layer their own request transform on top by mutating `req.raw_headers`
/// before calling `forward`.
pub fn transform_request(req: &mut RequestFingerprint) {
    req.raw_headers
        .retain(|(name, _)| !HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()));
}

/// Maps a transport-level failure to the stable `ProxyError` tags the error
/// design specifies, so the same upstream failure always produces the same
/// tag string regardless of which hyper internals surfaced it.
fn classify_error(err: &hyper_util::client::legacy::Error) -> ProxyError {
    let message = err.to_string();
    if let Some(source) = std::error::Error::source(err) {
        let source_msg = source.to_string();
        if source_msg.contains("certificate") || source_msg.contains("alert") {
            return ProxyError::UpstreamTlsError { alert: 40 };
        }
    }
    let code = if message.contains("dns error") || message.contains("failed to lookup") {
        "ENOTFOUND"
    } else if message.contains("connection refused") {
        "ECONNREFUSED"
    } else if message.contains("reset") {
        "ECONNRESET"
    } else if message.contains("timed out") || message.contains("timeout") {
        "ETIMEDOUT"
    } else {
        "EUNKNOWN"
    };
    ProxyError::UpstreamError {
        code: code.to_string(),
    }
}

fn build_client() -> Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>> {
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Client::builder(TokioExecutor::new()).build(https)
}

/// Forwards `req` to its real destination and returns the response the
/// caller should relay back downstream.
///
/// Applies spec §4.4 step 3's request transform before target resolution
/// (so a `replaceHost`/`matchReplacePath` etc. is reflected in the URI we
/// actually dial) and step 10's response transform before returning, in
/// each case preferring a `beforeRequest`/`beforeResponse` callback over the
/// declarative form if the rule set one (construction-time validation
/// guarantees at most one of the two is ever present).
pub async fn forward(
    req: &mut RequestFingerprint,
    cfg: &PassThroughStep,
    listener_addrs: &[SocketAddr],
) -> Result<StepResponse> {
    transform_request(req);

    if let Some(hook) = &cfg.before_request {
        match hook.call(req).await? {
            BeforeRequestOutcome::ShortCircuit(resp) => return Ok(resp),
            BeforeRequestOutcome::Transform(t) => t.apply(req)?,
        }
    } else if let Some(t) = &cfg.transform_request {
        t.apply(req)?;
    }

    let mut target = target::resolve(req)?;
    if target.host.eq_ignore_ascii_case("localhost") {
        target.host = dns_cache().probe_localhost(target.port).await.to_string();
        target.uri = http::Uri::builder()
            .scheme(target.scheme.as_str())
            .authority(format!("{}:{}", target.host, target.port))
            .path_and_query(
                target
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/"),
            )
            .build()
            .map_err(|e| ProxyError::Validation(format!("could not rebuild upstream URI: {e}")))?;
    }
    if target::would_loop(&target, listener_addrs) {
        return Err(ProxyError::LoopDetected);
    }

    if let Some(proxy) = upstream_proxy::from_env(&target.scheme, &target.host) {
        tracing::debug!(upstream = %proxy.uri, host = %target.host, "honoring environment proxy for pass-through");
    }

    if cfg.simulate_connection_errors {
        return Err(ProxyError::UpstreamError {
            code: "ECONNRESET".to_string(),
        });
    }

    let mut builder = hyper::Request::builder()
        .method(req.method.clone())
        .uri(target.uri.clone());
    for (name, value) in &req.raw_headers {
        builder = builder.header(name, value);
    }
    let outgoing = builder
        .body(Full::new(req.body.raw().clone()))
        .map_err(|e| ProxyError::Validation(format!("could not build upstream request: {e}")))?;

    let started = std::time::Instant::now();
    let response = if matches!(cfg.ignore_host_https_errors, crate::step::IgnoreHttpsErrors::None)
        && cfg.client_certificate_host_map.is_empty()
        && cfg.extra_ca_certificates_pem.is_empty()
    {
        shared_client()
            .request(outgoing)
            .await
            .map_err(|e| classify_error(&e))?
    } else {
        let config = tls::client_config_for_host(
            &cfg.ignore_host_https_errors,
            &cfg.extra_ca_certificates_pem,
            &cfg.client_certificate_host_map,
            &target.host,
            target.port,
        )?;
        let https = HttpsConnectorBuilder::new()
            .with_tls_config((*config).clone())
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(https);
        client.request(outgoing).await.map_err(|e| classify_error(&e))?
    };
    crate::metrics::PASSTHROUGH_LATENCY_MS
        .with_label_values(&[target.scheme.as_str()])
        .observe(started.elapsed().as_secs_f64() * 1000.0);

    let status = response.status().as_u16();
    let mut dropped_headers = Vec::new();
    let mut headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| match value.to_str() {
            Ok(v) => Some((name.as_str().to_string(), v.to_string())),
            Err(_) => {
                dropped_headers.push((name.as_str().to_string(), value.as_bytes().to_vec()));
                None
            }
        })
        .collect();
    // A header value hyper's `HeaderValue::to_str` rejects (non-visible-ASCII
    // bytes) would otherwise vanish silently; instead of dropping it we carry
    // it percent-encoded and tag the request so the client can see it went
    // missing from the plain header list.
    for (name, raw) in &dropped_headers {
        req.tags.push(format!("header-drop:{name}"));
        headers.push((
            "x-wiretap-unrepresentable-header".to_string(),
            format!("{name}={}", urlencoding::encode_binary(raw)),
        ));
    }
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| ProxyError::UpstreamError {
            code: e.to_string(),
        })?
        .to_bytes();

    let mut resp = StepResponse {
        status,
        headers,
        body,
    };

    if let Some(hook) = &cfg.before_response {
        match hook.call(req, &resp).await? {
            BeforeResponseOutcome::Close => return Err(AbortError::close().into()),
            BeforeResponseOutcome::Reset => return Err(AbortError::reset().into()),
            BeforeResponseOutcome::Transform(t) => t.apply(&mut resp)?,
        }
    } else if let Some(t) = &cfg.transform_response {
        t.apply(&mut resp)?;
    }

    Ok(resp)
}

fn shared_client() -> &'static Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>> {
    static CLIENT: once_cell::sync::Lazy<
        Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>,
    > = once_cell::sync::Lazy::new(build_client);
    &CLIENT
}

fn dns_cache() -> &'static dns::DnsCache {
    static CACHE: once_cell::sync::Lazy<dns::DnsCache> = once_cell::sync::Lazy::new(dns::DnsCache::new);
    &CACHE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_request_strips_hop_by_hop() {
        use crate::request::{Body, Protocol};
        use http::Method;
        use std::net::{IpAddr, Ipv4Addr};
        use url::Url;

        let mut req = RequestFingerprint::new(
            Method::GET,
            Url::parse("http://x/a").unwrap(),
            Protocol::Http,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1),
            vec![
                ("Connection".to_string(), "keep-alive".to_string()),
                ("X-Keep".to_string(), "yes".to_string()),
            ],
            false,
            Body::empty(),
        );
        transform_request(&mut req);
        assert!(req.header("connection").is_none());
        assert_eq!(req.header("x-keep"), Some("yes"));
    }
}
