//! Turns the opaque `{kind, ...params}` JSON descriptors a remote admin
//! client sends into real `Matcher`/`Step` values.
//!
//! A `Callback` matcher or step is the one case that needs more than its own
//! params: it needs the connection's [`RpcDispatcher`] so the resulting
//! `Matcher::Callback`/`Step::Callback` calls back out to the client that
//! registered it instead of running in-process.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::channel::rpc::{RemoteBeforeRequestHook, RemoteBeforeResponseHook, RemoteMatchCallback, RemoteRespondCallback};
use crate::channel::rpc::RpcDispatcher;
use crate::channel::wire::{MatcherWire, RuleWire, StepWire};
use crate::error::{ProxyError, Result};
use crate::passthrough::transform::{
    BodyTransform, HeaderTransform, HostTransform, JsonPatchOp, JsonPatchOpKind, MatchReplace,
    TransformRequest, TransformResponse, UpdateHostHeader,
};
use crate::step::{ClientCertificate, IgnoreHttpsErrors};
use crate::matcher::basic::{HostMatcher, HostnameMatcher, MethodMatcher, PortMatcher, ProtocolMatcher};
use crate::matcher::body::{
    FormDataMatcher, JsonBodyFlexibleMatcher, JsonBodyMatcher, MultipartFormMatcher,
    RawBodyIncludesMatcher, RawBodyMatcher, RegexBodyMatcher,
};
use crate::matcher::callback::CallbackMatcher;
use crate::matcher::header::{CookieMatcher, HeaderMatcher};
use crate::matcher::path::{FlexiblePathMatcher, RegexPathMatcher, RegexUrlMatcher};
use crate::matcher::query::{ExactQueryMatcher, QueryMatcher};
use crate::matcher::Matcher;
use crate::request::Protocol;
use crate::rule::RuleBuilder;
use crate::step::callback::CallbackStep;
use crate::step::connection::{CloseConnectionStep, ResetConnectionStep, TimeoutStep};
use crate::step::delay::{DelayStep, WaitForRequestBodyStep};
use crate::step::file::FileStep;
use crate::step::fixed::{FixedResponseStep, JsonStep};
use crate::step::jsonrpc::JsonRpcResponseStep;
use crate::step::stream::StreamStep;
use crate::step::webhook::{WebhookEvent, WebhookStep};
use crate::step::Step;

fn str_param(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProxyError::Validation(format!("missing string param {key:?}")))
}

fn u64_param(params: &Value, key: &str) -> Result<u64> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| ProxyError::Validation(format!("missing integer param {key:?}")))
}

fn pairs_param(params: &Value, key: &str) -> Vec<(String, String)> {
    params
        .get(key)
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn optional_pairs_param(params: &Value, key: &str) -> Vec<(String, Option<String>)> {
    params
        .get(key)
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string)))
                .collect()
        })
        .unwrap_or_default()
}

fn bytes_param(params: &Value, key: &str) -> Vec<u8> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.as_bytes().to_vec())
        .unwrap_or_default()
}

/// Builds a `Matcher` from its wire form. `dispatcher` is only consulted for
/// `kind == "callback"`, where it is required.
pub fn matcher_from_wire(wire: &MatcherWire, dispatcher: Option<&Arc<RpcDispatcher>>) -> Result<Matcher> {
    let p = &wire.params;
    Ok(match wire.kind.as_str() {
        "wildcard" => Matcher::Wildcard,
        "method" => {
            let method: http::Method = str_param(p, "method")?
                .parse()
                .map_err(|_| ProxyError::Validation("invalid HTTP method".into()))?;
            Matcher::Method(MethodMatcher(method))
        }
        "host" => Matcher::Host(HostMatcher(str_param(p, "host")?)),
        "hostname" => Matcher::Hostname(HostnameMatcher(str_param(p, "hostname")?)),
        "port" => Matcher::Port(PortMatcher(u64_param(p, "port")? as u16)),
        "protocol" => {
            let protocol = match str_param(p, "protocol")?.as_str() {
                "http" => Protocol::Http,
                "https" => Protocol::Https,
                "ws" => Protocol::Ws,
                "wss" => Protocol::Wss,
                other => return Err(ProxyError::Validation(format!("unknown protocol {other:?}"))),
            };
            Matcher::Protocol(ProtocolMatcher(protocol))
        }
        "flexible-path" => {
            let path = str_param(p, "path")?;
            let case_sensitive = p.get("caseSensitive").and_then(Value::as_bool).unwrap_or(true);
            Matcher::FlexiblePath(FlexiblePathMatcher::new(path, case_sensitive))
        }
        "regex-path" => Matcher::RegexPath(
            RegexPathMatcher::new(&str_param(p, "pattern")?)
                .map_err(|e| ProxyError::Validation(format!("invalid regex: {e}")))?,
        ),
        "regex-url" => Matcher::RegexUrl(
            RegexUrlMatcher::new(&str_param(p, "pattern")?)
                .map_err(|e| ProxyError::Validation(format!("invalid regex: {e}")))?,
        ),
        "header" => {
            let case_sensitive = p.get("caseSensitive").and_then(Value::as_bool).unwrap_or(false);
            Matcher::Header(HeaderMatcher::new(pairs_param(p, "headers"), case_sensitive))
        }
        "cookie" => Matcher::Cookie(CookieMatcher::new(pairs_param(p, "cookies"))),
        "exact-query" => Matcher::ExactQuery(ExactQueryMatcher(pairs_param(p, "query"))),
        "query" => Matcher::Query(QueryMatcher(pairs_param(p, "query"))),
        "form-data" => Matcher::FormData(FormDataMatcher(pairs_param(p, "fields"))),
        "multipart-form" => Matcher::MultipartForm(MultipartFormMatcher(optional_pairs_param(p, "fields"))),
        "raw-body" => Matcher::RawBody(RawBodyMatcher(bytes_param(p, "body"))),
        "raw-body-includes" => Matcher::RawBodyIncludes(RawBodyIncludesMatcher(bytes_param(p, "body"))),
        "regex-body" => Matcher::RegexBody(
            RegexBodyMatcher::new(&str_param(p, "pattern")?)
                .map_err(|e| ProxyError::Validation(format!("invalid regex: {e}")))?,
        ),
        "json-body" => Matcher::JsonBody(JsonBodyMatcher(
            p.get("value").cloned().unwrap_or(Value::Null),
        )),
        "json-body-flexible" => Matcher::JsonBodyFlexible(JsonBodyFlexibleMatcher(
            p.get("value").cloned().unwrap_or(Value::Null),
        )),
        "callback" => {
            let dispatcher = dispatcher.ok_or_else(|| {
                ProxyError::Validation("callback matcher requires an admin connection".into())
            })?;
            Matcher::Callback(CallbackMatcher::new(Arc::new(RemoteMatchCallback::new(
                dispatcher.clone(),
            ))))
        }
        other => return Err(ProxyError::Validation(format!("unknown matcher kind {other:?}"))),
    })
}

fn ignore_https_errors_from_wire(p: &Value) -> IgnoreHttpsErrors {
    match p.get("ignoreHostHttpsErrors") {
        Some(Value::Bool(true)) => IgnoreHttpsErrors::All,
        Some(Value::Array(arr)) => {
            let hosts = arr.iter().filter_map(Value::as_str).map(str::to_string).collect::<Vec<_>>();
            if hosts.is_empty() {
                IgnoreHttpsErrors::None
            } else {
                IgnoreHttpsErrors::Hosts(hosts)
            }
        }
        _ => IgnoreHttpsErrors::None,
    }
}

fn extra_ca_certificates_from_wire(p: &Value) -> Vec<Vec<u8>> {
    p.get("extraCACertificates")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(|s| s.as_bytes().to_vec()).collect())
        .unwrap_or_default()
}

fn client_certificate_host_map_from_wire(p: &Value) -> std::collections::HashMap<String, ClientCertificate> {
    p.get("clientCertificateHostMap")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(host, v)| {
                    let cert_chain_pem = v.get("certChain").and_then(Value::as_str)?.as_bytes().to_vec();
                    let private_key_pem = v.get("privateKey").and_then(Value::as_str)?.as_bytes().to_vec();
                    Some((
                        host.clone(),
                        ClientCertificate {
                            cert_chain_pem,
                            private_key_pem,
                        },
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn header_transform_from_wire(v: &Value) -> Option<HeaderTransform> {
    if let Some(update) = v.get("updateHeaders").and_then(Value::as_object) {
        return Some(HeaderTransform::Update(
            update
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
        ));
    }
    if let Some(replace) = v.get("replaceHeaders").and_then(Value::as_object) {
        return Some(HeaderTransform::Replace(
            replace
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
        ));
    }
    None
}

fn match_replace_list_from_wire(arr: &[Value]) -> Result<Vec<MatchReplace>> {
    arr.iter()
        .map(|pair| {
            let pair = pair
                .as_array()
                .ok_or_else(|| ProxyError::Validation("matchReplace entry must be a [pattern, replacement] pair".into()))?;
            let pattern = pair
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| ProxyError::Validation("matchReplace entry missing pattern".into()))?;
            let replacement = pair.get(1).and_then(Value::as_str).unwrap_or("");
            MatchReplace::new(pattern, replacement).map_err(|e| ProxyError::Validation(format!("invalid regex: {e}")))
        })
        .collect()
}

fn json_patch_op_from_wire(v: &Value) -> Result<JsonPatchOp> {
    let op = match v.get("op").and_then(Value::as_str) {
        Some("add") => JsonPatchOpKind::Add,
        Some("remove") => JsonPatchOpKind::Remove,
        Some("replace") => JsonPatchOpKind::Replace,
        Some("move") => JsonPatchOpKind::Move,
        Some("copy") => JsonPatchOpKind::Copy,
        Some("test") => JsonPatchOpKind::Test,
        other => return Err(ProxyError::Validation(format!("unknown json-patch op {other:?}"))),
    };
    let path = v
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::Validation("json-patch op missing path".into()))?
        .to_string();
    Ok(JsonPatchOp {
        op,
        path,
        value: v.get("value").cloned(),
        from: v.get("from").and_then(Value::as_str).map(str::to_string),
    })
}

fn body_transform_from_wire(v: &Value) -> Result<Option<BodyTransform>> {
    if let Some(s) = v.get("replaceBody").and_then(Value::as_str) {
        return Ok(Some(BodyTransform::Replace(Bytes::from(s.as_bytes().to_vec()))));
    }
    if let Some(path) = v.get("replaceBodyFromFile").and_then(Value::as_str) {
        return Ok(Some(BodyTransform::ReplaceFromFile(PathBuf::from(path))));
    }
    if let Some(patch) = v.get("updateJsonBody") {
        return Ok(Some(BodyTransform::UpdateJson(patch.clone())));
    }
    if let Some(ops) = v.get("patchJsonBody").and_then(Value::as_array) {
        let ops = ops.iter().map(json_patch_op_from_wire).collect::<Result<Vec<_>>>()?;
        return Ok(Some(BodyTransform::PatchJson(ops)));
    }
    if let Some(rules) = v.get("matchReplaceBody").and_then(Value::as_array) {
        return Ok(Some(BodyTransform::MatchReplace(match_replace_list_from_wire(rules)?)));
    }
    Ok(None)
}

/// Parses the declarative fields a `transformRequest` (or a `beforeRequest`
/// reply taking the declarative shape) carries on the wire.
pub fn transform_request_from_wire(v: &Value) -> Result<TransformRequest> {
    let replace_method = v
        .get("replaceMethod")
        .and_then(Value::as_str)
        .map(|s| s.parse::<http::Method>())
        .transpose()
        .map_err(|_| ProxyError::Validation("invalid replacement HTTP method".into()))?;
    let headers = header_transform_from_wire(v);
    let body = body_transform_from_wire(v)?;
    let host = if let Some(host) = v.get("replaceHost").and_then(Value::as_str) {
        Some(HostTransform::Replace {
            host: host.to_string(),
            port: v.get("replaceHostPort").and_then(Value::as_u64).map(|p| p as u16),
        })
    } else if let Some(rules) = v.get("matchReplaceHost").and_then(Value::as_array) {
        Some(HostTransform::MatchReplace(match_replace_list_from_wire(rules)?))
    } else {
        None
    };
    let match_replace_path = v
        .get("matchReplacePath")
        .and_then(Value::as_array)
        .map(|arr| match_replace_list_from_wire(arr))
        .transpose()?;
    let match_replace_query = v
        .get("matchReplaceQuery")
        .and_then(Value::as_array)
        .map(|arr| match_replace_list_from_wire(arr))
        .transpose()?;
    let set_protocol = match v.get("setProtocol").and_then(Value::as_str) {
        Some("http") => Some(Protocol::Http),
        Some("https") => Some(Protocol::Https),
        Some("ws") => Some(Protocol::Ws),
        Some("wss") => Some(Protocol::Wss),
        Some(other) => return Err(ProxyError::Validation(format!("unknown protocol {other:?}"))),
        None => None,
    };
    let update_host_header = match v.get("updateHostHeader") {
        None | Some(Value::Bool(true)) => UpdateHostHeader::Auto,
        Some(Value::Bool(false)) => UpdateHostHeader::Never,
        Some(Value::String(s)) => UpdateHostHeader::Custom(s.clone()),
        _ => UpdateHostHeader::Auto,
    };
    Ok(TransformRequest {
        replace_method,
        headers,
        body,
        host,
        match_replace_path,
        match_replace_query,
        set_protocol,
        update_host_header,
    })
}

/// Parses the declarative fields a `transformResponse` (or a
/// `beforeResponse` reply taking the declarative shape) carries on the wire.
pub fn transform_response_from_wire(v: &Value) -> Result<TransformResponse> {
    let replace_status = v.get("replaceStatus").and_then(Value::as_u64).map(|s| s as u16);
    let headers = header_transform_from_wire(v);
    let body = body_transform_from_wire(v)?;
    Ok(TransformResponse {
        replace_status,
        headers,
        body,
    })
}

/// Builds a `Step` from its wire form. `dispatcher` is only consulted for
/// `kind == "callback"`, where it is required.
pub fn step_from_wire(wire: &StepWire, dispatcher: Option<&Arc<RpcDispatcher>>) -> Result<Step> {
    let p = &wire.params;
    Ok(match wire.kind.as_str() {
        "fixed-response" => {
            let status = u64_param(p, "status")? as u16;
            let mut step = FixedResponseStep::new(status);
            for (name, value) in pairs_param(p, "headers") {
                step = step.with_header(name, value);
            }
            if let Some(body) = p.get("body").and_then(Value::as_str) {
                step = step.with_body(body.as_bytes().to_vec());
            }
            Step::FixedResponse(step)
        }
        "json" => {
            let status = u64_param(p, "status")? as u16;
            let value = p.get("value").cloned().unwrap_or(Value::Null);
            let mut step = JsonStep::new(status, value);
            for (name, value) in pairs_param(p, "headers") {
                step = step.with_header(name, value);
            }
            Step::Json(step)
        }
        "file" => {
            let status = u64_param(p, "status")? as u16;
            Step::File(FileStep::new(status, str_param(p, "path")?))
        }
        "stream" => {
            let status = u64_param(p, "status")? as u16;
            let chunks = p
                .get("chunks")
                .and_then(Value::as_array)
                .map(|arr| {
                    let messages: Vec<crate::channel::stream::StreamMessage> = arr
                        .iter()
                        .filter_map(|v| serde_json::from_value(v.clone()).ok())
                        .collect();
                    crate::channel::stream::decode_chunks(&messages)
                })
                .transpose()?
                .unwrap_or_default();
            Step::Stream(StreamStep::new(status, chunks))
        }
        "callback" => {
            let dispatcher = dispatcher.ok_or_else(|| {
                ProxyError::Validation("callback step requires an admin connection".into())
            })?;
            Step::Callback(CallbackStep::new(Arc::new(RemoteRespondCallback::new(
                dispatcher.clone(),
            ))))
        }
        "json-rpc-response" => {
            let status = u64_param(p, "status")? as u16;
            if let Some(error) = p.get("error") {
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("error")
                    .to_string();
                Step::JsonRpcResponse(JsonRpcResponseStep::error(status, code, message))
            } else {
                let result = p.get("result").cloned().unwrap_or(Value::Null);
                Step::JsonRpcResponse(JsonRpcResponseStep::result(status, result))
            }
        }
        "close-connection" => Step::CloseConnection(CloseConnectionStep),
        "reset-connection" => Step::ResetConnection(ResetConnectionStep),
        "timeout" => Step::Timeout(TimeoutStep),
        "delay" => Step::Delay(DelayStep::new(u64_param(p, "millis")?)),
        "wait-for-request-body" => Step::WaitForRequestBody(WaitForRequestBodyStep),
        "webhook" => {
            let url = str_param(p, "url")?;
            let events = p
                .get("events")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .filter_map(|s| match s {
                            "request" => Some(WebhookEvent::Request),
                            "response" => Some(WebhookEvent::Response),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_else(|| vec![WebhookEvent::Request, WebhookEvent::Response]);
            Step::Webhook(WebhookStep::new(url, events))
        }
        "pass-through" => {
            let simulate_connection_errors = p
                .get("simulateConnectionErrors")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let has_before_request = p.get("beforeRequest").is_some();
            let has_before_response = p.get("beforeResponse").is_some();
            if has_before_request && p.get("transformRequest").is_some() {
                return Err(ProxyError::Validation(
                    "pass-through step cannot set both transformRequest and beforeRequest".into(),
                ));
            }
            if has_before_response && p.get("transformResponse").is_some() {
                return Err(ProxyError::Validation(
                    "pass-through step cannot set both transformResponse and beforeResponse".into(),
                ));
            }

            let before_request = if has_before_request {
                let dispatcher = dispatcher.ok_or_else(|| {
                    ProxyError::Validation("beforeRequest hook requires an admin connection".into())
                })?;
                let hook: Arc<dyn crate::step::BeforeRequestHook> = Arc::new(RemoteBeforeRequestHook::new(dispatcher.clone()));
                Some(hook)
            } else {
                None
            };
            let before_response = if has_before_response {
                let dispatcher = dispatcher.ok_or_else(|| {
                    ProxyError::Validation("beforeResponse hook requires an admin connection".into())
                })?;
                let hook: Arc<dyn crate::step::BeforeResponseHook> = Arc::new(RemoteBeforeResponseHook::new(dispatcher.clone()));
                Some(hook)
            } else {
                None
            };
            let transform_request = p
                .get("transformRequest")
                .map(transform_request_from_wire)
                .transpose()?;
            let transform_response = p
                .get("transformResponse")
                .map(transform_response_from_wire)
                .transpose()?;

            let step = crate::step::PassThroughStep {
                ignore_host_https_errors: ignore_https_errors_from_wire(p),
                extra_ca_certificates_pem: extra_ca_certificates_from_wire(p),
                client_certificate_host_map: client_certificate_host_map_from_wire(p),
                simulate_connection_errors,
                transform_request,
                transform_response,
                before_request,
                before_response,
            };
            step.validate()?;
            Step::PassThrough(step)
        }
        "ws-pass-through" => Step::WsPassThrough(crate::step::WsPassThroughStep {
            ignore_host_https_errors: ignore_https_errors_from_wire(p),
            client_certificate_host_map: client_certificate_host_map_from_wire(p),
            simulate_connection_errors: p
                .get("simulateConnectionErrors")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        "ws-echo" => Step::WsEcho(crate::step::WsEchoStep),
        "ws-listen" => Step::WsListen(crate::step::WsListenStep),
        "ws-reject" => {
            let status = u64_param(p, "status")? as u16;
            let mut step = crate::step::WsRejectStep::new(status);
            for (name, value) in pairs_param(p, "headers") {
                step = step.with_header(name, value);
            }
            if let Some(body) = p.get("body").and_then(Value::as_str) {
                step = step.with_body(body.as_bytes().to_vec());
            }
            Step::WsReject(step)
        }
        other => return Err(ProxyError::Validation(format!("unknown step kind {other:?}"))),
    })
}

/// Builds a `RuleBuilder` (not yet installed) from its wire form.
pub fn rule_builder_from_wire(wire: &RuleWire, dispatcher: Option<&Arc<RpcDispatcher>>) -> Result<RuleBuilder> {
    let mut builder = RuleBuilder::new().priority(wire.priority);
    if let Some(id) = &wire.id {
        builder = builder.id(id.clone());
    }
    for matcher in &wire.matchers {
        builder = builder.matcher(matcher_from_wire(matcher, dispatcher)?);
    }
    for step in &wire.steps {
        builder = builder.step(step_from_wire(step, dispatcher)?);
    }
    if let Some(completion) = wire.completion.clone() {
        builder = builder.completion(completion.into());
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::wire::MatcherWire;
    use serde_json::json;

    #[test]
    fn test_method_matcher_from_wire() {
        let wire = MatcherWire {
            kind: "method".into(),
            params: json!({"method": "POST"}),
        };
        let matcher = matcher_from_wire(&wire, None).unwrap();
        assert_eq!(matcher.kind(), "method");
    }

    #[test]
    fn test_callback_matcher_requires_dispatcher() {
        let wire = MatcherWire {
            kind: "callback".into(),
            params: json!({}),
        };
        assert!(matcher_from_wire(&wire, None).is_err());
    }

    #[test]
    fn test_fixed_response_step_from_wire() {
        let wire = StepWire {
            kind: "fixed-response".into(),
            params: json!({"status": 201, "body": "hi"}),
        };
        let step = step_from_wire(&wire, None).unwrap();
        match step {
            Step::FixedResponse(s) => assert_eq!(s.status, 201),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_unknown_matcher_kind_errors() {
        let wire = MatcherWire {
            kind: "not-a-real-kind".into(),
            params: json!({}),
        };
        assert!(matcher_from_wire(&wire, None).is_err());
    }

    #[test]
    fn test_ws_reject_step_from_wire() {
        let wire = StepWire {
            kind: "ws-reject".into(),
            params: json!({"status": 401, "headers": {"WWW-Authenticate": "Basic"}}),
        };
        let step = step_from_wire(&wire, None).unwrap();
        match step {
            Step::WsReject(s) => {
                assert_eq!(s.status, 401);
                assert_eq!(s.headers, vec![("WWW-Authenticate".to_string(), "Basic".to_string())]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_ws_echo_and_listen_steps_from_wire() {
        let echo = step_from_wire(&StepWire { kind: "ws-echo".into(), params: json!({}) }, None).unwrap();
        assert!(matches!(echo, Step::WsEcho(_)));
        let listen = step_from_wire(&StepWire { kind: "ws-listen".into(), params: json!({}) }, None).unwrap();
        assert!(matches!(listen, Step::WsListen(_)));
    }
}
