//! The step pipeline: what a winning rule actually does with a request.
//!
//! A [`Rule`](crate::rule::Rule) carries an ordered list of `Step`s. The
//! [`executor`](crate::executor) runs them in order; most steps are terminal
//! (`is_final() == true`) and produce the response, while a handful of
//! "in-between" steps (`Delay`, `WaitForRequestBody`) just affect timing or
//! buffering before the remaining steps run.

pub mod callback;
pub mod connection;
pub mod delay;
pub mod file;
pub mod fixed;
pub mod jsonrpc;
pub mod passthrough;
pub mod stream;
pub mod webhook;
pub mod websocket;

use bytes::Bytes;
use serde_json::Value;

use crate::error::Result;
use crate::request::RequestFingerprint;

pub use callback::{CallbackStep, RespondCallback};
pub use connection::{CloseConnectionStep, ResetConnectionStep, TimeoutStep};
pub use delay::{DelayStep, WaitForRequestBodyStep};
pub use file::FileStep;
pub use fixed::{FixedResponseStep, JsonStep};
pub use jsonrpc::JsonRpcResponseStep;
pub use self::passthrough::{
    BeforeRequestHook, BeforeRequestOutcome, BeforeResponseHook, BeforeResponseOutcome,
    ClientCertificate, IgnoreHttpsErrors, PassThroughStep, WsPassThroughStep,
};
pub use stream::StreamStep;
pub use webhook::{WebhookEvent, WebhookStep};
pub use websocket::{WsEchoStep, WsListenStep, WsRejectStep};

/// A plain HTTP response produced by a step, prior to being written to the
/// wire by whichever transport (h1/h2/passthrough bridge) is serving the
/// request.
#[derive(Debug, Clone)]
pub struct StepResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StepResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json(status: u16, value: &Value) -> serde_json::Result<Self> {
        Ok(Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(serde_json::to_vec(value)?))
    }
}

/// One chunk of a `Stream` step's body, with an optional delay to wait before
/// writing it, so a rule can reproduce a slow/drip-fed upstream.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub data: Bytes,
    pub delay_ms: Option<u64>,
}

/// A response whose body is delivered as a sequence of chunks rather than
/// buffered up front, produced by the [`StreamStep`].
#[derive(Debug, Clone)]
pub struct StreamingResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<StreamChunk>,
}

/// What the executor should do after running one step.
pub enum StepOutcome {
    /// The step produced a final response; stop the pipeline.
    Respond(StepResponse),
    /// The step produced a final response whose body streams out chunk by
    /// chunk, possibly with inter-chunk delays.
    RespondStream(StreamingResponse),
    /// The step only affected context (delay elapsed, body buffered); run the
    /// next step in the pipeline.
    Continue,
    /// The pass-through steps hand off the live connection to the pass-through
    /// subsystem, which streams the response itself; the executor records
    /// that the step completed but does not construct a `StepResponse`.
    HandedOff,
}

/// Mutable, per-request scratch space threaded through the step pipeline.
/// Holds the pieces steps need that don't belong on `RequestFingerprint`
/// itself (which is meant to stay read-only from the matcher's point of view).
pub struct StepContext<'a> {
    pub request: &'a mut RequestFingerprint,
    pub rule_id: &'a str,
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    FixedResponse,
    Json,
    File,
    Stream,
    Callback,
    JsonRpcResponse,
    CloseConnection,
    ResetConnection,
    Timeout,
    Delay,
    WaitForRequestBody,
    Webhook,
    PassThrough,
    WsPassThrough,
    WsEcho,
    WsListen,
    WsReject,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::FixedResponse => "fixed-response",
            StepKind::Json => "json",
            StepKind::File => "file",
            StepKind::Stream => "stream",
            StepKind::Callback => "callback",
            StepKind::JsonRpcResponse => "json-rpc-response",
            StepKind::CloseConnection => "close-connection",
            StepKind::ResetConnection => "reset-connection",
            StepKind::Timeout => "timeout",
            StepKind::Delay => "delay",
            StepKind::WaitForRequestBody => "wait-for-request-body",
            StepKind::Webhook => "webhook",
            StepKind::PassThrough => "pass-through",
            StepKind::WsPassThrough => "ws-pass-through",
            StepKind::WsEcho => "ws-echo",
            StepKind::WsListen => "ws-listen",
            StepKind::WsReject => "ws-reject",
        }
    }
}

/// One entry in a rule's step pipeline.
pub enum Step {
    FixedResponse(FixedResponseStep),
    Json(JsonStep),
    File(FileStep),
    Stream(StreamStep),
    Callback(CallbackStep),
    JsonRpcResponse(JsonRpcResponseStep),
    CloseConnection(CloseConnectionStep),
    ResetConnection(ResetConnectionStep),
    Timeout(TimeoutStep),
    Delay(DelayStep),
    WaitForRequestBody(WaitForRequestBodyStep),
    Webhook(WebhookStep),
    PassThrough(PassThroughStep),
    WsPassThrough(WsPassThroughStep),
    WsEcho(WsEchoStep),
    WsListen(WsListenStep),
    WsReject(WsRejectStep),
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::FixedResponse(_) => StepKind::FixedResponse,
            Step::Json(_) => StepKind::Json,
            Step::File(_) => StepKind::File,
            Step::Stream(_) => StepKind::Stream,
            Step::Callback(_) => StepKind::Callback,
            Step::JsonRpcResponse(_) => StepKind::JsonRpcResponse,
            Step::CloseConnection(_) => StepKind::CloseConnection,
            Step::ResetConnection(_) => StepKind::ResetConnection,
            Step::Timeout(_) => StepKind::Timeout,
            Step::Delay(_) => StepKind::Delay,
            Step::WaitForRequestBody(_) => StepKind::WaitForRequestBody,
            Step::Webhook(_) => StepKind::Webhook,
            Step::PassThrough(_) => StepKind::PassThrough,
            Step::WsPassThrough(_) => StepKind::WsPassThrough,
            Step::WsEcho(_) => StepKind::WsEcho,
            Step::WsListen(_) => StepKind::WsListen,
            Step::WsReject(_) => StepKind::WsReject,
        }
    }

    /// Whether this step, if reached, always produces a response or hands the
    /// connection off (i.e. must be the last step in a rule's pipeline).
    /// `Delay`, `WaitForRequestBody`, and `Webhook` are the only non-final
    /// steps; a `Rule` with a non-final step anywhere but the list's tail,
    /// or a final step anywhere but the tail, fails construction-time
    /// validation.
    pub fn is_final(&self) -> bool {
        !matches!(
            self,
            Step::Delay(_) | Step::WaitForRequestBody(_) | Step::Webhook(_)
        )
    }

    /// Construction-time validation beyond the position checks
    /// [`crate::rule::RuleBuilder::build`] already applies. Only
    /// `PassThrough` currently has anything to check (transform/callback
    /// exclusivity); every other step is unconditionally valid once built.
    pub fn validate(&self) -> Result<()> {
        match self {
            Step::PassThrough(cfg) => cfg.validate(),
            _ => Ok(()),
        }
    }

    pub async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        match self {
            Step::FixedResponse(s) => s.run(ctx).await,
            Step::Json(s) => s.run(ctx).await,
            Step::File(s) => s.run(ctx).await,
            Step::Stream(s) => s.run(ctx).await,
            Step::Callback(s) => s.run(ctx).await,
            Step::JsonRpcResponse(s) => s.run(ctx).await,
            Step::CloseConnection(s) => s.run(ctx).await,
            Step::ResetConnection(s) => s.run(ctx).await,
            Step::Timeout(s) => s.run(ctx).await,
            Step::Delay(s) => s.run(ctx).await,
            Step::WaitForRequestBody(s) => s.run(ctx).await,
            Step::Webhook(s) => s.run(ctx).await,
            // Pass-through and WebSocket-only steps are special-cased by the
            // executor, which hands the live (possibly-to-be-upgraded)
            // connection to the server layer rather than going through this
            // generic `run`.
            Step::PassThrough(_)
            | Step::WsPassThrough(_)
            | Step::WsEcho(_)
            | Step::WsListen(_)
            | Step::WsReject(_) => Ok(StepOutcome::HandedOff),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_and_wait_are_not_final() {
        assert!(!Step::Delay(DelayStep::new(10)).is_final());
        assert!(!Step::WaitForRequestBody(WaitForRequestBodyStep).is_final());
    }

    #[test]
    fn test_fixed_response_is_final() {
        assert!(Step::FixedResponse(FixedResponseStep::new(200)).is_final());
    }
}
