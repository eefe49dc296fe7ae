//! The observability event bus.
//!
//! Every significant thing that happens to a request — it arrived, a rule
//! answered it, an abort fired, a TLS or client-level error occurred, a
//! pass-through WebSocket connected — is published here. Admin clients
//! subscribe over the [`channel`](crate::channel) subsystem; tests can
//! subscribe directly via [`EventBus::subscribe`].
//!
//! Built on [`tokio::sync::broadcast`]: slow subscribers lag rather than
//! block the request path, matching the "observability must never slow down
//! the proxy" requirement.

use tokio::sync::broadcast;

use crate::request::RequestFingerprint;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub request_id: String,
    pub method: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub request_id: String,
    pub rule_id: Option<String>,
    pub status: u16,
    pub duration_ms: f64,
}

#[derive(Debug, Clone)]
pub struct AbortEvent {
    pub request_id: String,
    pub rule_id: Option<String>,
    pub kind: crate::error::AbortKind,
}

#[derive(Debug, Clone)]
pub struct TlsErrorEvent {
    pub remote_addr: String,
    pub alert: u8,
}

#[derive(Debug, Clone)]
pub struct ClientErrorEvent {
    pub request_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct PassthroughWebsocketConnectEvent {
    pub request_id: String,
    pub method: String,
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub raw_headers: Vec<(String, String)>,
    pub subprotocols: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Event {
    Request(RequestEvent),
    Response(ResponseEvent),
    Abort(AbortEvent),
    TlsError(TlsErrorEvent),
    ClientError(ClientErrorEvent),
    PassthroughWebsocketConnect(PassthroughWebsocketConnectEvent),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Request(_) => "request",
            Event::Response(_) => "response",
            Event::Abort(_) => "abort",
            Event::TlsError(_) => "tls-error",
            Event::ClientError(_) => "client-error",
            Event::PassthroughWebsocketConnect(_) => "passthrough-websocket-connect",
        }
    }
}

/// Thin wrapper over a `broadcast::Sender<Event>`, built fresh per `Engine`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishes an event. Returns the number of active subscribers that
    /// received it; `Err` only happens with zero subscribers, which is not
    /// an error condition for a fire-and-forget bus, so callers can ignore
    /// the result.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience used by the executor/server to tag a request's fingerprint
/// and publish the corresponding event together.
pub fn tag_and_publish_abort(
    bus: &EventBus,
    req: &mut RequestFingerprint,
    request_id: &str,
    rule_id: Option<&str>,
    kind: crate::error::AbortKind,
) {
    req.tag(format!("{kind:?}").to_lowercase());
    bus.publish(Event::Abort(AbortEvent {
        request_id: request_id.to_string(),
        rule_id: rule_id.map(|s| s.to_string()),
        kind,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::Request(RequestEvent {
            request_id: "r1".into(),
            method: "GET".into(),
            url: "http://x/a".into(),
        }));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "request");
    }

    #[tokio::test]
    async fn test_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
