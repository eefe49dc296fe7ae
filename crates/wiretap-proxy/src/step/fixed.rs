//! `FixedResponse` and `Json` steps: the simplest possible reply.

use bytes::Bytes;
use serde_json::Value;

use super::{StepContext, StepOutcome, StepResponse};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct FixedResponseStep {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FixedResponseStep {
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

    pub async fn run(&self, _ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        let mut resp = StepResponse::new(self.status).with_body(self.body.clone());
        resp.headers = self.headers.clone();
        Ok(StepOutcome::Respond(resp))
    }
}

/// A `FixedResponse` whose body is a JSON value, serialized once at
/// construction time and replayed verbatim on every match (`Content-Type`
/// defaults to `application/json` unless overridden).
#[derive(Debug, Clone)]
pub struct JsonStep {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub value: Value,
}

impl JsonStep {
    pub fn new(status: u16, value: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            value,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub async fn run(&self, _ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        let mut resp = StepResponse::json(self.status, &self.value)
            .map_err(|e| crate::error::ProxyError::DecodeError(e.to_string()))?;
        for (name, value) in &self.headers {
            resp = resp.with_header(name.clone(), value.clone());
        }
        Ok(StepOutcome::Respond(resp))
    }
}
