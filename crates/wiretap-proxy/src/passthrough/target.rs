//! Resolves the real upstream target for a pass-through request and guards
//! against forwarding loops (a rule configured to pass through requests that
//! are themselves addressed at this proxy's own listener).

use std::net::SocketAddr;

use crate::error::{ProxyError, Result};
use crate::request::RequestFingerprint;

/// The upstream target a pass-through request should be sent to: scheme,
/// host, port, and the request's own path+query (unchanged unless a
/// transform rewrote it beforehand).
#[derive(Debug, Clone)]
pub struct Target {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub uri: http::Uri,
}

pub fn resolve(req: &RequestFingerprint) -> Result<Target> {
    let url = &req.url;
    let scheme = url.scheme().to_string();
    let mut host = url
        .host_str()
        .ok_or_else(|| ProxyError::Validation("request URL has no host".into()))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProxyError::Validation("request URL has no resolvable port".into()))?;

    // Spec §4.4 step 1: if the downstream source is localhost but the TCP
    // peer that actually opened the connection isn't, the request reached us
    // through something like a container port-forward — route the
    // pass-through to the peer's real address rather than back into this
    // machine's loopback.
    if super::dns::is_localhost(&host) && !req.remote_addr.ip().is_loopback() {
        host = req.remote_addr.ip().to_string();
    }

    let path_and_query = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    };

    let uri = http::Uri::builder()
        .scheme(scheme.as_str())
        .authority(format!("{host}:{port}"))
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::Validation(format!("could not build upstream URI: {e}")))?;

    Ok(Target {
        scheme,
        host,
        port,
        uri,
    })
}

/// Forwarding back into one of this engine's own listener addresses would
/// hang the request forever (it would just get matched again, assuming the
/// same rule still applies) or, worse, create an infinite forward loop.
pub fn would_loop(target: &Target, listener_addrs: &[SocketAddr]) -> bool {
    listener_addrs.iter().any(|addr| {
        addr.port() == target.port
            && (addr.ip().is_unspecified() || host_matches_ip(&target.host, &addr.ip().to_string()))
    })
}

fn host_matches_ip(host: &str, ip: &str) -> bool {
    host == ip || host.eq_ignore_ascii_case("localhost") && (ip == "127.0.0.1" || ip == "::1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Protocol};
    use http::Method;
    use std::net::{IpAddr, Ipv4Addr};
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
    fn test_resolve_builds_absolute_uri() {
        let target = resolve(&req("https://example.com/a/b?x=1")).unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
        assert_eq!(target.uri.path_and_query().unwrap().as_str(), "/a/b?x=1");
    }

    #[test]
    fn test_would_loop_matches_listener_port_and_localhost() {
        let target = resolve(&req("http://localhost:8080/a")).unwrap();
        let listeners = vec![SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            8080,
        )];
        assert!(would_loop(&target, &listeners));
    }

    #[test]
    fn test_would_loop_false_for_different_port() {
        let target = resolve(&req("http://example.com:9999/a")).unwrap();
        let listeners = vec![SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            8080,
        )];
        assert!(!would_loop(&target, &listeners));
    }
}
