//! Correlation-ID'd outstanding-request map for callback round-trips.
//!
//! The `Callback` matcher/step and `beforeRequest`/`beforeResponse` transform
//! hooks can be backed by a remote admin client rather than an in-process
//! closure. When that's the case, evaluating the callback means writing a
//! `MatchCallbackRequest`/`RespondCallbackRequest` onto the outbound half of
//! the channel and waiting for the client to reply with a `CallbackReply`
//! carrying the same `correlation_id` — this module is the waiting side of
//! that round trip.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::channel::wire::{RecordedRequestWire, RecordedResponseWire, ServerMessage};
use crate::error::{ProxyError, Result};
use crate::matcher::callback::MatchCallback;
use crate::request::RequestFingerprint;
use crate::step::callback::{CallbackReply, RespondCallback};
use crate::step::{
    BeforeRequestHook, BeforeRequestOutcome, BeforeResponseHook, BeforeResponseOutcome,
    StepContext, StepResponse,
};

/// Converts a live request into its wire snapshot. `matched_rule_id` is
/// always `None` here: a callback is consulted *during* rule evaluation, so
/// no winner has been decided yet.
pub fn to_recorded_request_wire(req: &RequestFingerprint) -> RecordedRequestWire {
    RecordedRequestWire {
        method: req.method.to_string(),
        url: req.url.to_string(),
        headers: req.raw_headers.clone(),
        body: crate::channel::body::WireBody::from_bytes(req.body.raw()),
        matched_rule_id: None,
        tags: req.tags.clone(),
    }
}

fn to_recorded_response_wire(resp: &StepResponse) -> RecordedResponseWire {
    RecordedResponseWire {
        status: resp.status,
        headers: resp.headers.clone(),
        body: crate::channel::body::WireBody::from_bytes(&resp.body),
    }
}

/// Owns the correlation map for one admin connection. Shared (via `Arc`)
/// between every `RemoteMatchCallback`/`RemoteRespondCallback` registered
/// over that connection, and fed replies by the connection's read loop
/// (see [`crate::channel::ConnectionHandle::handle_callback_reply`]).
pub struct RpcDispatcher {
    outbound: mpsc::UnboundedSender<ServerMessage>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl RpcDispatcher {
    pub fn new(outbound: mpsc::UnboundedSender<ServerMessage>) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Sends a message that isn't an RPC reply waited on by this dispatcher
    /// (an `Ack`/`Error` reply to a non-callback request, an `Event`
    /// broadcast, or a `RuleMatched` notification) straight out over the
    /// connection's outbound half.
    pub fn send_direct(&self, message: ServerMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| ProxyError::Channel("admin connection closed".into()))
    }

    /// Resolves the outstanding call waiting on `correlation_id`, if any.
    /// Replies for unknown (already-timed-out, or never-issued) correlation
    /// ids are silently dropped, matching a fire-and-forget channel's
    /// tolerance for a client replying late or twice.
    pub fn complete(&self, correlation_id: &str, result: Value) {
        if let Some(tx) = self
            .pending
            .lock()
            .expect("rpc dispatcher mutex poisoned")
            .remove(correlation_id)
        {
            let _ = tx.send(result);
        }
    }

    async fn dispatch(
        &self,
        kind: &'static str,
        req: &RequestFingerprint,
        build: impl FnOnce(String, RecordedRequestWire) -> ServerMessage,
    ) -> Result<Value> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("rpc dispatcher mutex poisoned")
            .insert(correlation_id.clone(), tx);

        let wire = to_recorded_request_wire(req);
        let message = build(correlation_id.clone(), wire);
        if self.outbound.send(message).is_err() {
            self.pending
                .lock()
                .expect("rpc dispatcher mutex poisoned")
                .remove(&correlation_id);
            return Err(ProxyError::Channel(
                "admin connection closed before callback could be dispatched".into(),
            ));
        }

        let started = Instant::now();
        let result = rx.await.map_err(|_| {
            ProxyError::Channel("callback RPC reply channel dropped before a reply arrived".into())
        })?;
        crate::metrics::CHANNEL_RPC_DURATION_MS
            .with_label_values(&[kind])
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        Ok(result)
    }

    /// Same round trip as [`dispatch`](Self::dispatch), for a callback that
    /// also needs to hand the client a response snapshot (`beforeResponse`).
    async fn dispatch_with_response(
        &self,
        kind: &'static str,
        req: &RequestFingerprint,
        resp: &StepResponse,
        build: impl FnOnce(String, RecordedRequestWire, RecordedResponseWire) -> ServerMessage,
    ) -> Result<Value> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("rpc dispatcher mutex poisoned")
            .insert(correlation_id.clone(), tx);

        let request_wire = to_recorded_request_wire(req);
        let response_wire = to_recorded_response_wire(resp);
        let message = build(correlation_id.clone(), request_wire, response_wire);
        if self.outbound.send(message).is_err() {
            self.pending
                .lock()
                .expect("rpc dispatcher mutex poisoned")
                .remove(&correlation_id);
            return Err(ProxyError::Channel(
                "admin connection closed before callback could be dispatched".into(),
            ));
        }

        let started = Instant::now();
        let result = rx.await.map_err(|_| {
            ProxyError::Channel("callback RPC reply channel dropped before a reply arrived".into())
        })?;
        crate::metrics::CHANNEL_RPC_DURATION_MS
            .with_label_values(&[kind])
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        Ok(result)
    }
}

/// Backs a `Matcher::Callback` whose predicate lives on a remote admin
/// client rather than in-process.
pub struct RemoteMatchCallback {
    dispatcher: Arc<RpcDispatcher>,
}

impl RemoteMatchCallback {
    pub fn new(dispatcher: Arc<RpcDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl MatchCallback for RemoteMatchCallback {
    async fn call(&self, req: &RequestFingerprint) -> Result<bool> {
        let value = self
            .dispatcher
            .dispatch("matcher", req, |correlation_id, request| {
                ServerMessage::MatchCallbackRequest {
                    correlation_id,
                    request,
                }
            })
            .await?;
        value.as_bool().ok_or_else(|| {
            ProxyError::CallbackThrew("remote match callback did not reply with a boolean".into())
        })
    }
}

/// Backs a `Step::Callback` whose response lives on a remote admin client.
pub struct RemoteRespondCallback {
    dispatcher: Arc<RpcDispatcher>,
}

impl RemoteRespondCallback {
    pub fn new(dispatcher: Arc<RpcDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl RespondCallback for RemoteRespondCallback {
    async fn call(&self, ctx: &mut StepContext<'_>) -> Result<CallbackReply> {
        let value = self
            .dispatcher
            .dispatch("step", ctx.request, |correlation_id, request| {
                ServerMessage::RespondCallbackRequest {
                    correlation_id,
                    request,
                }
            })
            .await?;
        parse_callback_reply(value)
    }
}

/// Backs a pass-through `beforeRequest` hook whose decision lives on a
/// remote admin client.
pub struct RemoteBeforeRequestHook {
    dispatcher: Arc<RpcDispatcher>,
}

impl RemoteBeforeRequestHook {
    pub fn new(dispatcher: Arc<RpcDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl BeforeRequestHook for RemoteBeforeRequestHook {
    async fn call(&self, req: &RequestFingerprint) -> Result<BeforeRequestOutcome> {
        let value = self
            .dispatcher
            .dispatch("before-request", req, |correlation_id, request| {
                ServerMessage::BeforeRequestCallbackRequest {
                    correlation_id,
                    request,
                }
            })
            .await?;
        parse_before_request_reply(value)
    }
}

fn parse_before_request_reply(value: Value) -> Result<BeforeRequestOutcome> {
    if let Some(reply) = value.get("shortCircuit") {
        let status = reply
            .get("status")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProxyError::CallbackThrew("beforeRequest shortCircuit reply has no status".into()))?
            as u16;
        let mut response = StepResponse::new(status);
        if let Some(headers) = reply.get("headers").and_then(Value::as_object) {
            for (name, v) in headers {
                if let Some(value) = v.as_str() {
                    response = response.with_header(name.clone(), value.to_string());
                }
            }
        }
        if let Some(body) = reply.get("body").and_then(Value::as_str) {
            response = response.with_body(body.as_bytes().to_vec());
        }
        return Ok(BeforeRequestOutcome::ShortCircuit(response));
    }
    Ok(BeforeRequestOutcome::Transform(
        crate::channel::convert::transform_request_from_wire(&value)?,
    ))
}

/// Backs a pass-through `beforeResponse` hook whose decision lives on a
/// remote admin client.
pub struct RemoteBeforeResponseHook {
    dispatcher: Arc<RpcDispatcher>,
}

impl RemoteBeforeResponseHook {
    pub fn new(dispatcher: Arc<RpcDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl BeforeResponseHook for RemoteBeforeResponseHook {
    async fn call(&self, req: &RequestFingerprint, resp: &StepResponse) -> Result<BeforeResponseOutcome> {
        let value = self
            .dispatcher
            .dispatch_with_response(
                "before-response",
                req,
                resp,
                |correlation_id, request, response| ServerMessage::BeforeResponseCallbackRequest {
                    correlation_id,
                    request,
                    response,
                },
            )
            .await?;
        parse_before_response_reply(value)
    }
}

fn parse_before_response_reply(value: Value) -> Result<BeforeResponseOutcome> {
    if let Some(action) = value.get("action").and_then(Value::as_str) {
        return match action {
            "close" => Ok(BeforeResponseOutcome::Close),
            "reset" => Ok(BeforeResponseOutcome::Reset),
            other => Err(ProxyError::CallbackThrew(format!(
                "remote beforeResponse hook returned unknown action {other:?}"
            ))),
        };
    }
    Ok(BeforeResponseOutcome::Transform(
        crate::channel::convert::transform_response_from_wire(&value)?,
    ))
}

/// A remote respond callback's reply is either `{"action": "close"|"reset"}`
/// or a response description `{"status": u16, "headers"?: {...}, "body"?:
/// <base64 or text>}`.
fn parse_callback_reply(value: Value) -> Result<CallbackReply> {
    if let Some(action) = value.get("action").and_then(Value::as_str) {
        return match action {
            "close" => Ok(CallbackReply::Abort(crate::error::AbortError::close())),
            "reset" => Ok(CallbackReply::Abort(crate::error::AbortError::reset())),
            other => Err(ProxyError::CallbackThrew(format!(
                "remote respond callback returned unknown action {other:?}"
            ))),
        };
    }

    let status = value
        .get("status")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProxyError::CallbackThrew("remote respond callback reply has no status".into()))?
        as u16;

    let mut response = StepResponse::new(status);
    if let Some(headers) = value.get("headers").and_then(Value::as_object) {
        for (name, v) in headers {
            if let Some(value) = v.as_str() {
                response = response.with_header(name.clone(), value.to_string());
            }
        }
    }
    if let Some(body) = value.get("body").and_then(Value::as_str) {
        response = response.with_body(body.as_bytes().to_vec());
    }

    Ok(CallbackReply::Response(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Protocol};
    use http::Method;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use url::Url;

    fn req() -> RequestFingerprint {
        RequestFingerprint::new(
            Method::GET,
            Url::parse("http://x/a").unwrap(),
            Protocol::Http,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1),
            vec![],
            false,
            Body::empty(),
        )
    }

    #[tokio::test]
    async fn test_remote_match_callback_roundtrips() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let dispatcher = RpcDispatcher::new(outbound_tx);
        let callback = RemoteMatchCallback::new(dispatcher.clone());

        let call = tokio::spawn({
            let r = req();
            async move { callback.call(&r).await }
        });

        let message = outbound_rx.recv().await.unwrap();
        let correlation_id = match message {
            ServerMessage::MatchCallbackRequest { correlation_id, .. } => correlation_id,
            _ => panic!("expected MatchCallbackRequest"),
        };
        dispatcher.complete(&correlation_id, json!(true));

        assert!(call.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_remote_respond_callback_parses_response() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let dispatcher = RpcDispatcher::new(outbound_tx);
        let callback = RemoteRespondCallback::new(dispatcher.clone());

        let mut r = req();
        let call = tokio::spawn(async move {
            let mut ctx = StepContext {
                request: &mut r,
                rule_id: "rule-1",
                debug: false,
            };
            callback.call(&mut ctx).await
        });

        let message = outbound_rx.recv().await.unwrap();
        let correlation_id = match message {
            ServerMessage::RespondCallbackRequest { correlation_id, .. } => correlation_id,
            _ => panic!("expected RespondCallbackRequest"),
        };
        dispatcher.complete(&correlation_id, json!({"status": 204}));

        match call.await.unwrap().unwrap() {
            CallbackReply::Response(resp) => assert_eq!(resp.status, 204),
            CallbackReply::Abort(_) => panic!("expected Response"),
        }
    }

    #[tokio::test]
    async fn test_remote_respond_callback_parses_abort() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let dispatcher = RpcDispatcher::new(outbound_tx);
        let callback = RemoteRespondCallback::new(dispatcher.clone());

        let mut r = req();
        let call = tokio::spawn(async move {
            let mut ctx = StepContext {
                request: &mut r,
                rule_id: "rule-1",
                debug: false,
            };
            callback.call(&mut ctx).await
        });

        let message = outbound_rx.recv().await.unwrap();
        let correlation_id = match message {
            ServerMessage::RespondCallbackRequest { correlation_id, .. } => correlation_id,
            _ => panic!("expected RespondCallbackRequest"),
        };
        dispatcher.complete(&correlation_id, json!({"action": "reset"}));

        match call.await.unwrap().unwrap() {
            CallbackReply::Abort(err) => assert_eq!(err.kind, crate::error::AbortKind::Reset),
            CallbackReply::Response(_) => panic!("expected Abort"),
        }
    }
}
