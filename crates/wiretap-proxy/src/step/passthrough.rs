//! Configuration carried by the `PassThrough`/`WsPassThrough` steps.
//!
//! Execution itself lives in [`crate::passthrough`]; this module only holds
//! the per-rule configuration (declarative transforms, callback hooks, TLS
//! and proxy policy) the pass-through subsystem reads back out of the step.
//! A rule may set a declarative [`TransformRequest`]/[`TransformResponse`] or
//! a [`BeforeRequestHook`]/[`BeforeResponseHook`] callback, never both —
//! [`PassThroughStep::validate`] enforces that at rule-construction time, not
//! at request time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::StepResponse;
use crate::error::{ProxyError, Result};
use crate::passthrough::transform::{TransformRequest, TransformResponse};
use crate::request::RequestFingerprint;

/// Which upstream hosts should have certificate verification disabled.
/// Mirrors spec §4.4 step 4's `ignoreHostHttpsErrors` (list, or the boolean
/// `true` meaning "every host").
#[derive(Debug, Clone, Default)]
pub enum IgnoreHttpsErrors {
    #[default]
    None,
    All,
    Hosts(Vec<String>),
}

impl IgnoreHttpsErrors {
    /// `host` may be a bare hostname or a `host:port` pair; both forms are
    /// checked against the configured list per spec §4.4 step 4 ("host:port
    /// in same OR the list is the boolean `true`").
    pub fn allows(&self, host: &str, port: u16) -> bool {
        match self {
            IgnoreHttpsErrors::None => false,
            IgnoreHttpsErrors::All => true,
            IgnoreHttpsErrors::Hosts(list) => {
                let host_port = format!("{host}:{port}");
                list.iter()
                    .any(|entry| entry.eq_ignore_ascii_case(host) || entry.eq_ignore_ascii_case(&host_port))
            }
        }
    }
}

/// A client certificate (PEM-encoded chain + key) offered to upstreams
/// matching a `clientCertificateHostMap` entry.
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    pub cert_chain_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

/// Outcome of a `beforeRequest` callback: either declarative transform
/// fields to apply (same shape `apply` would use), or an outright
/// short-circuit response that skips forwarding entirely (spec §4.4 step 3:
/// "a `response` short-circuit").
pub enum BeforeRequestOutcome {
    Transform(TransformRequest),
    ShortCircuit(StepResponse),
}

#[async_trait]
pub trait BeforeRequestHook: Send + Sync {
    async fn call(&self, req: &RequestFingerprint) -> Result<BeforeRequestOutcome>;
}

/// Outcome of a `beforeResponse` callback: declarative transform fields, or
/// a request to close/reset the connection instead of relaying a response
/// (spec §4.4 step 10: "`beforeResponse` may also return `close` or
/// `reset`").
pub enum BeforeResponseOutcome {
    Transform(TransformResponse),
    Close,
    Reset,
}

#[async_trait]
pub trait BeforeResponseHook: Send + Sync {
    async fn call(&self, req: &RequestFingerprint, resp: &StepResponse) -> Result<BeforeResponseOutcome>;
}

/// A pass-through target: forward this request to the real upstream server.
/// Execution lives in [`crate::passthrough`]; this struct only carries the
/// per-rule configuration the pass-through subsystem needs.
#[derive(Clone, Default)]
pub struct PassThroughStep {
    pub ignore_host_https_errors: IgnoreHttpsErrors,
    pub extra_ca_certificates_pem: Vec<Vec<u8>>,
    pub client_certificate_host_map: HashMap<String, ClientCertificate>,
    pub simulate_connection_errors: bool,
    pub transform_request: Option<TransformRequest>,
    pub transform_response: Option<TransformResponse>,
    pub before_request: Option<Arc<dyn BeforeRequestHook>>,
    pub before_response: Option<Arc<dyn BeforeResponseHook>>,
}

impl PassThroughStep {
    /// Enforces spec §4.4's "transform + callback exclusivity" (spec §9
    /// design note): a rule configures at most one of declarative transform
    /// or callback hook, per direction.
    pub fn validate(&self) -> Result<()> {
        if self.transform_request.is_some() && self.before_request.is_some() {
            return Err(ProxyError::Validation(
                "pass-through step cannot set both transformRequest and beforeRequest".into(),
            ));
        }
        if self.transform_response.is_some() && self.before_response.is_some() {
            return Err(ProxyError::Validation(
                "pass-through step cannot set both transformResponse and beforeResponse".into(),
            ));
        }
        if let Some(t) = &self.transform_request {
            t.validate()?;
        }
        if let Some(t) = &self.transform_response {
            t.validate()?;
        }
        Ok(())
    }
}

impl fmt::Debug for PassThroughStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassThroughStep")
            .field("ignore_host_https_errors", &self.ignore_host_https_errors)
            .field("client_certificate_hosts", &self.client_certificate_host_map.keys().collect::<Vec<_>>())
            .field("simulate_connection_errors", &self.simulate_connection_errors)
            .field("transform_request", &self.transform_request)
            .field("transform_response", &self.transform_response)
            .field("before_request", &self.before_request.is_some())
            .field("before_response", &self.before_response.is_some())
            .finish()
    }
}

/// A pass-through target for an upgraded WebSocket connection. Shares the
/// TLS/proxy/cert policy with [`PassThroughStep`] but has no body transforms
/// (WebSocket frames aren't subject to spec §4.4's declarative transforms).
#[derive(Debug, Clone, Default)]
pub struct WsPassThroughStep {
    pub ignore_host_https_errors: IgnoreHttpsErrors,
    pub client_certificate_host_map: HashMap<String, ClientCertificate>,
    pub simulate_connection_errors: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_https_errors_all_matches_everything() {
        let policy = IgnoreHttpsErrors::All;
        assert!(policy.allows("anything.example", 443));
    }

    #[test]
    fn test_ignore_https_errors_hosts_matches_bare_and_host_port() {
        let policy = IgnoreHttpsErrors::Hosts(vec!["example.com".to_string(), "other.com:8443".to_string()]);
        assert!(policy.allows("example.com", 443));
        assert!(policy.allows("other.com", 8443));
        assert!(!policy.allows("other.com", 443));
        assert!(!policy.allows("nope.com", 443));
    }

    #[test]
    fn test_validate_rejects_transform_and_callback_together() {
        struct NoopHook;
        #[async_trait::async_trait]
        impl BeforeRequestHook for NoopHook {
            async fn call(&self, _req: &RequestFingerprint) -> Result<BeforeRequestOutcome> {
                unreachable!()
            }
        }
        let step = PassThroughStep {
            transform_request: Some(TransformRequest::default()),
            before_request: Some(Arc::new(NoopHook)),
            ..Default::default()
        };
        assert!(step.validate().is_err());
    }
}
