//! The three WebSocket-only step variants that don't forward anywhere:
//! `ws-echo` (bounce every frame straight back), `ws-listen` (accept the
//! upgrade and silently consume frames, sending nothing), and `ws-reject`
//! (answer the upgrade attempt with a fixed non-101 response, the WebSocket
//! analogue of [`super::FixedResponseStep`]).
//!
//! None of the three produce a [`super::StepOutcome`] through the generic
//! [`super::Step::run`] dispatch — like `WsPassThrough`, the executor hands
//! them off to the server layer, which owns the raw upgraded connection.

use bytes::Bytes;

/// Accepts the upgrade, then echoes every downstream frame straight back
/// (text/binary preserved, `ping`/`pong` answered by tokio-tungstenite
/// itself, `close` mirrored once before the socket shuts down).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsEchoStep;

/// Accepts the upgrade, then reads and discards downstream frames without
/// ever writing one back. Useful for rules that only want to observe/record
/// a WebSocket session.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsListenStep;

/// Rejects the upgrade attempt outright with a fixed status/headers/body,
/// the same shape as [`super::FixedResponseStep`] but never switching
/// protocols at all.
#[derive(Debug, Clone)]
pub struct WsRejectStep {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl WsRejectStep {
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
}
