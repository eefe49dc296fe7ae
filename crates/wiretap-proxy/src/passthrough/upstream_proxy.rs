//! Resolves an upstream HTTP(S) proxy to forward pass-through traffic
//! through, the way curl/most HTTP clients honor `HTTP_PROXY`/`HTTPS_PROXY`/
//! `NO_PROXY`.

use std::env;

/// The upstream proxy to use for a given target scheme, if any applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub uri: String,
}

/// Reads `HTTPS_PROXY`/`HTTP_PROXY` (and their lowercase forms) from the
/// environment, honoring `NO_PROXY` host exclusions. Returns `None` when no
/// proxy applies, meaning the caller should connect directly.
pub fn from_env(scheme: &str, host: &str) -> Option<ProxyTarget> {
    if is_no_proxy(host) {
        return None;
    }
    let var_name = if scheme == "https" {
        "HTTPS_PROXY"
    } else {
        "HTTP_PROXY"
    };
    env::var(var_name)
        .ok()
        .or_else(|| env::var(var_name.to_lowercase()).ok())
        .map(|uri| ProxyTarget { uri })
}

fn is_no_proxy(host: &str) -> bool {
    let Ok(no_proxy) = env::var("NO_PROXY").or_else(|_| env::var("no_proxy")) else {
        return false;
    };
    no_proxy
        .split(',')
        .map(str::trim)
        .any(|pattern| !pattern.is_empty() && (pattern == "*" || host_matches(host, pattern)))
}

fn host_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.trim_start_matches('.');
    host.eq_ignore_ascii_case(pattern) || host.to_lowercase().ends_with(&format!(".{}", pattern.to_lowercase()))
}
