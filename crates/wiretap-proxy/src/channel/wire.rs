//! Wire schema for the admin duplex channel: what a remote client can send
//! the engine, and what the engine sends back (RPC replies and broadcast
//! events).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::body::WireBody;
use crate::events::Event;
use crate::rule::DEFAULT_PRIORITY;

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

/// A rule as it travels over the wire: matchers and steps are carried as
/// opaque JSON descriptors (`kind` + parameters) rather than the in-process
/// `Matcher`/`Step` enums, since a remote client has no access to Rust types
/// — [`crate::channel::rpc`] is responsible for turning these into real
/// `Matcher`/`Step` values, resolving `Callback` entries to RPC stubs that
/// call back out to the client that registered them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleWire {
    pub id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    pub matchers: Vec<MatcherWire>,
    pub steps: Vec<StepWire>,
    /// Absent on the wire means "no explicit checker" — the null completion
    /// state, which is *not* the same as an explicit `{"type": "always"}`,
    /// even though both let the rule match
    /// indefinitely: see [`crate::selector`] for how the two differ once a
    /// rule has matched at least once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub struct MatcherWire {
    pub kind: String,
    #[serde(flatten)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepWire {
    pub kind: String,
    #[serde(flatten)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CompletionWire {
    Always,
    Once,
    Twice,
    Thrice,
    Times { count: u64 },
}

impl From<CompletionWire> for crate::completion::CompletionChecker {
    fn from(wire: CompletionWire) -> Self {
        use crate::completion::CompletionChecker;
        match wire {
            CompletionWire::Always => CompletionChecker::Always,
            CompletionWire::Once => CompletionChecker::Once,
            CompletionWire::Twice => CompletionChecker::Twice,
            CompletionWire::Thrice => CompletionChecker::Thrice,
            CompletionWire::Times { count } => CompletionChecker::NTimes(count),
        }
    }
}

/// A matched request as recorded for the admin client's benefit — the same
/// information `RequestFingerprint` holds, with the body encoded for the
/// wire via [`WireBody`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedRequestWire {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: WireBody,
    pub matched_rule_id: Option<String>,
    pub tags: Vec<String>,
}

/// A pass-through response snapshot, offered to a `beforeResponse` callback
/// over the wire the same way [`RecordedRequestWire`] offers the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedResponseWire {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: WireBody,
}

/// What a remote admin client can ask of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    AddRule { correlation_id: String, rule: RuleWire },
    RemoveRule { correlation_id: String, rule_id: String },
    Reset { correlation_id: String },
    WaitForRuleMatch { correlation_id: String, rule_id: String },
    SubscribeEvents { correlation_id: String },
    /// A reply to a `MatchCallbackRequest`/`RespondCallbackRequest` the
    /// engine sent earlier, correlated by `correlation_id`.
    CallbackReply { correlation_id: String, result: Value },
}

/// What the engine can send a remote admin client, either as a direct RPC
/// reply (carrying the same `correlation_id` as the request) or as an
/// unsolicited broadcast (events, callback dispatches).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Ack { correlation_id: String },
    Error { correlation_id: String, message: String },
    RuleMatched { correlation_id: String, request: RecordedRequestWire },
    Event { event: String, payload: Value },
    /// Dispatches a `Callback` matcher/step evaluation to the client that
    /// registered it; the client must reply with a `CallbackReply` carrying
    /// the same `correlation_id`.
    MatchCallbackRequest { correlation_id: String, request: RecordedRequestWire },
    RespondCallbackRequest { correlation_id: String, request: RecordedRequestWire },
    /// Dispatches a pass-through `beforeRequest` hook to a remote admin
    /// client. The reply is either `{"shortCircuit": <response>}` or
    /// declarative transform fields in the same shape `transformRequest`
    /// accepts on the wire.
    BeforeRequestCallbackRequest { correlation_id: String, request: RecordedRequestWire },
    /// Dispatches a pass-through `beforeResponse` hook. The reply is either
    /// `{"action": "close"|"reset"}` or declarative `transformResponse`
    /// fields.
    BeforeResponseCallbackRequest {
        correlation_id: String,
        request: RecordedRequestWire,
        response: RecordedResponseWire,
    },
}

impl From<&Event> for ServerMessage {
    fn from(event: &Event) -> Self {
        let payload = match event {
            Event::Request(e) => serde_json::json!({ "requestId": e.request_id, "method": e.method, "url": e.url }),
            Event::Response(e) => serde_json::json!({ "requestId": e.request_id, "ruleId": e.rule_id, "status": e.status, "durationMs": e.duration_ms }),
            Event::Abort(e) => serde_json::json!({ "requestId": e.request_id, "ruleId": e.rule_id, "kind": format!("{:?}", e.kind) }),
            Event::TlsError(e) => serde_json::json!({ "remoteAddr": e.remote_addr, "alert": e.alert }),
            Event::ClientError(e) => serde_json::json!({ "requestId": e.request_id, "message": e.message }),
            Event::PassthroughWebsocketConnect(e) => serde_json::json!({
                "requestId": e.request_id,
                "method": e.method,
                "protocol": e.protocol,
                "hostname": e.hostname,
                "port": e.port,
                "path": e.path,
                "rawHeaders": e.raw_headers,
                "subprotocols": e.subprotocols,
            }),
        };
        ServerMessage::Event {
            event: event.kind().to_string(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_roundtrips() {
        let msg = ClientMessage::RemoveRule {
            correlation_id: "c1".into(),
            rule_id: "r1".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::RemoveRule { rule_id, .. } => assert_eq!(rule_id, "r1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_server_message_from_event() {
        let event = Event::Response(crate::events::ResponseEvent {
            request_id: "req-1".into(),
            rule_id: Some("rule-1".into()),
            status: 200,
            duration_ms: 1.5,
        });
        let message: ServerMessage = (&event).into();
        match message {
            ServerMessage::Event { event, payload } => {
                assert_eq!(event, "response");
                assert_eq!(payload["status"], 200);
            }
            _ => panic!("wrong variant"),
        }
    }
}
