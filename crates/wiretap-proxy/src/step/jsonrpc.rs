//! `JsonRpcResponse` step: wrap a result or error in a JSON-RPC 2.0 envelope,
//! echoing back the request's own `id` where the caller's request body
//! carries one.

use serde_json::{json, Value};

use super::{StepContext, StepOutcome, StepResponse};
use crate::error::Result;

#[derive(Debug, Clone)]
pub enum JsonRpcOutcome {
    Result(Value),
    Error { code: i64, message: String },
}

#[derive(Debug, Clone)]
pub struct JsonRpcResponseStep {
    pub status: u16,
    pub outcome: JsonRpcOutcome,
}

impl JsonRpcResponseStep {
    pub fn result(status: u16, value: Value) -> Self {
        Self {
            status,
            outcome: JsonRpcOutcome::Result(value),
        }
    }

    pub fn error(status: u16, code: i64, message: impl Into<String>) -> Self {
        Self {
            status,
            outcome: JsonRpcOutcome::Error {
                code,
                message: message.into(),
            },
        }
    }

    pub async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        let id = ctx
            .request
            .body
            .as_json()
            .ok()
            .and_then(|v| v.get("id").cloned())
            .unwrap_or(Value::Null);

        let envelope = match &self.outcome {
            JsonRpcOutcome::Result(value) => json!({
                "jsonrpc": "2.0",
                "result": value,
                "id": id,
            }),
            JsonRpcOutcome::Error { code, message } => json!({
                "jsonrpc": "2.0",
                "error": { "code": code, "message": message },
                "id": id,
            }),
        };

        let resp = StepResponse::json(self.status, &envelope)
            .map_err(|e| crate::error::ProxyError::DecodeError(e.to_string()))?;
        Ok(StepOutcome::Respond(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Protocol, RequestFingerprint};
    use bytes::Bytes;
    use http::Method;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use url::Url;

    fn req(body: &'static [u8]) -> RequestFingerprint {
        RequestFingerprint::new(
            Method::POST,
            Url::parse("http://x/rpc").unwrap(),
            Protocol::Http,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1),
            vec![],
            false,
            Body::new(Bytes::from_static(body), Some("application/json".into())),
        )
    }

    #[tokio::test]
    async fn test_json_rpc_echoes_request_id() {
        let step = JsonRpcResponseStep::result(200, json!({"ok": true}));
        let mut r = req(br#"{"jsonrpc":"2.0","method":"ping","id":42}"#);
        let mut ctx = StepContext {
            request: &mut r,
            rule_id: "rule-1",
            debug: false,
        };
        match step.run(&mut ctx).await.unwrap() {
            StepOutcome::Respond(resp) => {
                let value: Value = serde_json::from_slice(&resp.body).unwrap();
                assert_eq!(value["id"], 42);
                assert_eq!(value["result"]["ok"], true);
            }
            _ => panic!("expected Respond"),
        }
    }

    #[tokio::test]
    async fn test_json_rpc_error_envelope() {
        let step = JsonRpcResponseStep::error(200, -32601, "method not found");
        let mut r = req(br#"{"jsonrpc":"2.0","method":"x","id":"abc"}"#);
        let mut ctx = StepContext {
            request: &mut r,
            rule_id: "rule-1",
            debug: false,
        };
        match step.run(&mut ctx).await.unwrap() {
            StepOutcome::Respond(resp) => {
                let value: Value = serde_json::from_slice(&resp.body).unwrap();
                assert_eq!(value["error"]["code"], -32601);
                assert_eq!(value["id"], "abc");
            }
            _ => panic!("expected Respond"),
        }
    }
}
