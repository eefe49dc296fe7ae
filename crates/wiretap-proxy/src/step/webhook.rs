//! `Webhook` step: fire an asynchronous notification to an external URL
//! about the matched request, without itself producing a response.
//!
//! Unlike `PassThrough`, the webhook target is not the request's own
//! destination — it's a side notification, so this is a **non-final**
//! step: the pipeline always continues to whatever comes
//! next (typically a terminal responder). Delivery failures are logged and
//! never surfaced to the caller.

use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use once_cell::sync::Lazy;
use serde_json::json;

use super::{StepContext, StepOutcome};
use crate::error::Result;

static WEBHOOK_CLIENT: Lazy<Client<HttpConnector, Full<Bytes>>> =
    Lazy::new(|| Client::builder(TokioExecutor::new()).build_http());

/// Which lifecycle event(s) a webhook notifies on. `Response` notifications
/// are fired by [`crate::executor`] once the pipeline's terminal outcome is
/// known, since that's the earliest point a response description exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    Request,
    Response,
}

#[derive(Debug, Clone)]
pub struct WebhookStep {
    pub url: String,
    pub events: Vec<WebhookEvent>,
}

impl WebhookStep {
    pub fn new(url: impl Into<String>, events: Vec<WebhookEvent>) -> Self {
        Self {
            url: url.into(),
            events,
        }
    }

    /// Fires the `request` notification (if selected) without blocking the
    /// pipeline, then always continues to the next step.
    pub async fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        if self.events.contains(&WebhookEvent::Request) {
            let notification = json!({
                "event": "request",
                "method": ctx.request.method.as_str(),
                "url": ctx.request.url.as_str(),
                "ruleId": ctx.rule_id,
            });
            spawn_delivery(self.url.clone(), notification);
        }
        Ok(StepOutcome::Continue)
    }

    /// Fires the `response` notification (if selected). Called by the
    /// executor once a rule's pipeline has produced its terminal outcome,
    /// since a `Webhook` step itself never sees the eventual response.
    pub fn notify_response(&self, rule_id: &str, status: u16) {
        if self.events.contains(&WebhookEvent::Response) {
            let notification = json!({
                "event": "response",
                "ruleId": rule_id,
                "status": status,
            });
            spawn_delivery(self.url.clone(), notification);
        }
    }
}

fn spawn_delivery(url: String, notification: serde_json::Value) {
    tokio::spawn(async move {
        let Ok(body) = serde_json::to_vec(&notification) else {
            return;
        };
        let request = match hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(&url)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%url, error = %e, "could not build webhook request");
                return;
            }
        };

        if let Err(e) = WEBHOOK_CLIENT.request(request).await {
            tracing::warn!(%url, error = %e, "webhook delivery failed");
        }
    });
}
