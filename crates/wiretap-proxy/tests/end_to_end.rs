//! Drives real requests over real TCP sockets against a bound engine
//! listener, exercising the end-to-end scenarios from the project design
//! docs (fixed reply, priority, completion exhaustion, pass-through
//! transform, match-and-replace) the way a user of this crate actually
//! would: `server::serve_listener` plus a real HTTP client, not direct calls
//! into the selector/executor.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::json;
use tokio::net::TcpStream;

use wiretap_proxy::completion::CompletionChecker;
use wiretap_proxy::engine::Engine;
use wiretap_proxy::matcher::Matcher;
use wiretap_proxy::selector::FallbackPolicy;
use wiretap_proxy::server;
use wiretap_proxy::step::{FixedResponseStep, PassThroughStep, Step, WsRejectStep};

type Plain = Client<HttpConnector, Full<Bytes>>;

fn plain_client() -> Plain {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

async fn spawn_engine(engine: Arc<Engine>) -> SocketAddr {
    let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server::serve_listener(engine, listener).await;
    });
    // Give the accept loop a moment to actually start listening.
    tokio::task::yield_now().await;
    addr
}

async fn get(client: &Plain, addr: SocketAddr, path: &str) -> (u16, String) {
    let uri = format!("http://{addr}{path}");
    let resp = client.get(uri.parse().unwrap()).await.unwrap();
    let status = resp.status().as_u16();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

/// Connects to `proxy_addr` directly and sends a request whose target is the
/// full `absolute_url`, the way a client configured to use `proxy_addr` as
/// its HTTP forward proxy would — distinct from `get`, which always targets
/// the socket it connects to.
async fn get_via_proxy(proxy_addr: SocketAddr, absolute_url: &str) -> (u16, String) {
    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = hyper::Request::builder()
        .method("GET")
        .uri(absolute_url)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    let status = resp.status().as_u16();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

async fn request(client: &Plain, addr: SocketAddr, method: &str, path: &str) -> u16 {
    let uri = format!("http://{addr}{path}");
    let req = hyper::Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap();
    client.request(req).await.unwrap().status().as_u16()
}

/// Scenario 1: a rule matching method + path answers with a fixed body;
/// anything else falls through to the engine's fallback policy.
#[tokio::test]
async fn scenario_fixed_reply_and_fallback() {
    let engine = Arc::new(Engine::with_fallback(FallbackPolicy::UnmatchedRequest));
    engine
        .add_rule(
            wiretap_proxy::rule::Rule::builder()
                .matcher(Matcher::method(http::Method::GET))
                .matcher(Matcher::flexible_path("/a", true))
                .step(Step::FixedResponse(
                    FixedResponseStep::new(418).with_body(Bytes::from_static(b"teapot")),
                )),
        )
        .unwrap();

    let addr = spawn_engine(engine).await;
    let client = plain_client();

    let (status, body) = get(&client, addr, "/a").await;
    assert_eq!(status, 418);
    assert_eq!(body, "teapot");

    let (status, _) = get(&client, addr, "/b").await;
    assert_eq!(status, 503);
}

/// Scenario 2: among matching rules, the highest-priority group wins
/// regardless of registration order.
#[tokio::test]
async fn scenario_priority_selects_over_fallback_rule() {
    let engine = Arc::new(Engine::with_fallback(FallbackPolicy::UnmatchedRequest));
    engine
        .add_rule(
            wiretap_proxy::rule::Rule::builder()
                .priority(0)
                .matcher(Matcher::Wildcard)
                .step(Step::FixedResponse(FixedResponseStep::new(404))),
        )
        .unwrap();
    engine
        .add_rule(
            wiretap_proxy::rule::Rule::builder()
                .priority(1)
                .matcher(Matcher::method(http::Method::GET))
                .step(Step::FixedResponse(FixedResponseStep::new(200))),
        )
        .unwrap();

    let addr = spawn_engine(engine).await;
    let client = plain_client();

    assert_eq!(request(&client, addr, "GET", "/x").await, 200);
    assert_eq!(request(&client, addr, "POST", "/x").await, 404);
}

/// Scenario 3: a rule with a `Twice` completion checker answers its first
/// two matches, then a lower-priority/no-checker rule takes over.
#[tokio::test]
async fn scenario_completion_exhaustion_falls_through_to_next_rule() {
    let engine = Arc::new(Engine::with_fallback(FallbackPolicy::UnmatchedRequest));
    engine
        .add_rule(
            wiretap_proxy::rule::Rule::builder()
                .matcher(Matcher::Wildcard)
                .completion(CompletionChecker::Twice)
                .step(Step::FixedResponse(FixedResponseStep::new(201))),
        )
        .unwrap();
    engine
        .add_rule(
            wiretap_proxy::rule::Rule::builder()
                .matcher(Matcher::Wildcard)
                .step(Step::FixedResponse(FixedResponseStep::new(202))),
        )
        .unwrap();

    let addr = spawn_engine(engine).await;
    let client = plain_client();

    assert_eq!(request(&client, addr, "GET", "/x").await, 201);
    assert_eq!(request(&client, addr, "GET", "/x").await, 201);
    assert_eq!(request(&client, addr, "GET", "/x").await, 202);
}

/// Scenario 4: a pass-through rule's declarative `updateJsonBody` transform
/// rewrites the upstream's JSON response before it reaches the client.
#[tokio::test]
async fn scenario_passthrough_transforms_upstream_json_response() {
    // A tiny real upstream that always answers `GET /p` with `{"a":1}`.
    let upstream_engine = Arc::new(Engine::new());
    upstream_engine
        .add_rule(
            wiretap_proxy::rule::Rule::builder()
                .matcher(Matcher::method(http::Method::GET))
                .matcher(Matcher::flexible_path("/p", true))
                .step(Step::FixedResponse(
                    FixedResponseStep::new(200)
                        .with_header("content-type", "application/json")
                        .with_body(Bytes::from(serde_json::to_vec(&json!({"a": 1})).unwrap())),
                )),
        )
        .unwrap();
    let upstream_addr = spawn_engine(upstream_engine).await;

    let mut transform = wiretap_proxy::passthrough::transform::TransformResponse::default();
    transform.body = Some(wiretap_proxy::passthrough::transform::BodyTransform::UpdateJson(
        json!({"b": 2, "a": null}),
    ));
    let passthrough = PassThroughStep {
        transform_response: Some(transform),
        ..Default::default()
    };

    let front_engine = Arc::new(Engine::new());
    front_engine
        .add_rule(
            wiretap_proxy::rule::Rule::builder()
                .matcher(Matcher::method(http::Method::GET))
                .step(Step::PassThrough(passthrough)),
        )
        .unwrap();
    let front_addr = spawn_engine(front_engine).await;

    let (status, body) = get_via_proxy(front_addr, &format!("http://{upstream_addr}/p")).await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json, json!({"b": 2}));
}

/// Scenario 5: a pass-through rule's `matchReplacePath` transform rewrites
/// the upstream-bound path before the request ever leaves this proxy.
#[tokio::test]
async fn scenario_match_and_replace_rewrites_upstream_path() {
    let upstream_engine = Arc::new(Engine::new());
    upstream_engine
        .add_rule(
            wiretap_proxy::rule::Rule::builder()
                .matcher(Matcher::method(http::Method::GET))
                .matcher(Matcher::flexible_path("/new/x", true))
                .step(Step::FixedResponse(
                    FixedResponseStep::new(200).with_body(Bytes::from_static(b"rewritten")),
                )),
        )
        .unwrap();
    let upstream_addr = spawn_engine(upstream_engine).await;

    let mut transform = wiretap_proxy::passthrough::transform::TransformRequest::default();
    transform.match_replace_path = Some(vec![wiretap_proxy::passthrough::transform::MatchReplace::new(
        "^/old",
        "/new",
    )
    .unwrap()]);
    let passthrough = PassThroughStep {
        transform_request: Some(transform),
        ..Default::default()
    };

    let front_engine = Arc::new(Engine::new());
    front_engine
        .add_rule(
            wiretap_proxy::rule::Rule::builder()
                .matcher(Matcher::method(http::Method::GET))
                .step(Step::PassThrough(passthrough)),
        )
        .unwrap();
    let front_addr = spawn_engine(front_engine).await;

    let (status, body) = get_via_proxy(front_addr, &format!("http://{upstream_addr}/old/x")).await;
    assert_eq!(status, 200);
    assert_eq!(body, "rewritten");
}

/// Scenario 6: a `ws-reject` step answers an upgrade attempt with a fixed
/// non-101 response, mirroring an upstream rejecting the handshake — status
/// line, headers, then a closed socket, with no switch to the WebSocket
/// protocol ever happening.
#[tokio::test]
async fn scenario_websocket_reject_mirrors_status_and_headers() {
    let engine = Arc::new(Engine::new());
    engine
        .add_rule(
            wiretap_proxy::rule::Rule::builder().matcher(Matcher::Wildcard).step(
                Step::WsReject(WsRejectStep::new(401).with_header("WWW-Authenticate", "Basic")),
            ),
        )
        .unwrap();
    let addr = spawn_engine(engine).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = hyper::Request::builder()
        .method("GET")
        .uri("/socket")
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
        .header("Sec-WebSocket-Version", "13")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    assert_eq!(
        resp.headers().get("WWW-Authenticate").unwrap().to_str().unwrap(),
        "Basic"
    );
}
