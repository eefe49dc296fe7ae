//! The hyper-based listener: converts accepted sockets and parsed
//! `hyper::Request`s into `RequestFingerprint`s and step-pipeline outcomes
//! back into `hyper::Response`s. Holds no matching logic of its own — every
//! decision is the [`Engine`]'s; this module is glue, the same role the
//! teacher's `proxy::server` plays relative to its own core matching engine.
//!
//! A second, much simpler listener (`serve_admin_channel`) accepts admin
//! connections and hands each one to a [`crate::channel::ConnectionHandle`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use socket2::SockRef;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::channel::ConnectionHandle;
use crate::engine::Engine;
use crate::error::{AbortKind, ProxyError, Result};
use crate::executor::ExecutionOutcome;
use crate::passthrough;
use crate::request::{Body, Protocol, RequestFingerprint};
use crate::step::StepResponse;

/// Binds `addr` and serves HTTP/1.1 and HTTP/2 (cleartext) connections,
/// dispatching every request through `engine`, until the returned future is
/// dropped or `engine.stop()` closes out its tracked listener state.
///
/// TLS termination (and the CA certificate handling a MITM deployment needs)
/// is deliberately left to the embedder: this function serves plaintext
/// HTTP, matching how `wiretap-cli` runs its ephemeral listener. A caller
/// that needs HTTPS interception terminates TLS in front of this listener
/// and forwards the decrypted stream in.
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> Result<()> {
    let listener = bind(addr).await?;
    serve_listener(engine, listener).await
}

/// Binds `addr` without starting the accept loop, so a caller that needs the
/// actual ephemeral port up front (`wiretap-cli`, spawning a child process
/// that must be told where the proxy listens) can read it from the returned
/// listener before handing it to [`serve_listener`].
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Validation(format!("could not bind {addr}: {e}")))
}

/// Runs the accept loop against an already-bound listener, registering its
/// local address with `engine` for pass-through loop detection.
pub async fn serve_listener(engine: Arc<Engine>, listener: TcpListener) -> Result<()> {
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ProxyError::Validation(format!("could not read bound address: {e}")))?;
    engine.start(bound_addr);

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        let engine = engine.clone();
        tokio::spawn(async move {
            serve_connection(engine, stream, remote_addr).await;
        });
    }
}

/// Drives one accepted connection to completion, tearing the raw socket down
/// out-of-band (bypassing hyper's keep-alive response loop entirely) when a
/// step signals an [`AbortKind`] rather than producing a response.
///
/// `stream` is duplicated into a second, plain `std::net::TcpStream` handle
/// (`linger_handle`) before being handed to hyper: the two are distinct file
/// descriptors referring to the same socket, so `linger_handle` can carry a
/// `SO_LINGER` setting applied out of hyper's view, and the connection only
/// fully closes (sending the FIN or, with linger set, the RST) once every
/// descriptor referencing it — hyper's and ours — has been dropped.
async fn serve_connection(engine: Arc<Engine>, stream: tokio::net::TcpStream, remote_addr: SocketAddr) {
    let (stream, linger_handle) = match duplicate_for_linger(stream) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, %remote_addr, "could not duplicate accepted socket, dropping connection");
            return;
        }
    };

    let (abort_tx, mut abort_rx) = mpsc::channel::<AbortKind>(1);
    let service = hyper::service::service_fn(move |req| {
        let engine = engine.clone();
        let abort_tx = abort_tx.clone();
        async move { Ok::<_, Infallible>(handle(engine, req, remote_addr, abort_tx).await) }
    });

    let io = TokioIo::new(stream);
    let mut conn = Box::pin(
        auto::Builder::new(TokioExecutor::new()).serve_connection_with_upgrades(io, service),
    );

    tokio::select! {
        res = &mut conn => {
            if let Err(e) = res {
                debug!(error = %e, %remote_addr, "connection closed with error");
            }
        }
        Some(kind) = abort_rx.recv() => {
            // Drop the connection future first: it owns hyper's half of the
            // duplicated socket, and that descriptor must close before our
            // own `linger_handle` does for the abort to actually happen.
            drop(conn);
            if kind == AbortKind::Reset {
                if let Err(e) = SockRef::from(&linger_handle).set_linger(Some(Duration::ZERO)) {
                    debug!(error = %e, %remote_addr, "failed to set SO_LINGER for reset-connection step");
                }
            }
            debug!(%remote_addr, ?kind, "connection torn down by an abort step");
        }
    }
}

/// Duplicates an accepted socket into the tokio `TcpStream` handed to hyper
/// plus a plain `std::net::TcpStream` kept aside purely for `SO_LINGER`
/// control. The two are distinct file descriptors referring to the same
/// underlying socket; closing both is what finally tears the connection down
/// (with a trailing RST if `SO_LINGER` was set to zero on either one first).
fn duplicate_for_linger(
    stream: tokio::net::TcpStream,
) -> std::io::Result<(tokio::net::TcpStream, std::net::TcpStream)> {
    let std_stream = stream.into_std()?;
    let linger_handle = std_stream.try_clone()?;
    let stream = tokio::net::TcpStream::from_std(std_stream)?;
    Ok((stream, linger_handle))
}

/// Runs the admin duplex channel listener: every accepted connection gets
/// its own [`ConnectionHandle`] driving `engine` for that client's lifetime.
pub async fn serve_admin_channel(engine: Arc<Engine>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Validation(format!("could not bind admin channel {addr}: {e}")))?;
    serve_admin_channel_listener(engine, listener).await
}

/// Runs the admin channel accept loop against an already-bound listener, the
/// counterpart to [`serve_listener`] for callers that need the bound
/// ephemeral port before the loop starts.
pub async fn serve_admin_channel_listener(engine: Arc<Engine>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "admin channel accept failed");
                continue;
            }
        };
        let (handle, _outbound) = ConnectionHandle::new(engine.clone());
        tokio::spawn(async move {
            if let Err(e) = handle.run(stream).await {
                debug!(error = %e, %remote_addr, "admin connection closed with error");
            }
        });
    }
}

async fn handle(
    engine: Arc<Engine>,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    abort_tx: mpsc::Sender<AbortKind>,
) -> Response<Full<Bytes>> {
    if is_websocket_upgrade(&req) {
        return handle_websocket_upgrade(engine, req, remote_addr, abort_tx).await;
    }

    let max_body = engine.max_body_bytes();
    let (parts, incoming) = req.into_parts();
    let body_bytes = match incoming.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return error_response(502, format!("failed to read request body: {e}")),
    };
    if body_bytes.len() > max_body {
        return error_response(413, "request body exceeds the configured limit".to_string());
    }

    let url = match absolute_url(&parts) {
        Ok(url) => url,
        Err(e) => return error_response(400, e),
    };
    let content_type = parts
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let raw_headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect();
    let is_h2 = parts.version == hyper::Version::HTTP_2;

    let mut fingerprint = RequestFingerprint::new(
        parts.method,
        url,
        if is_h2 { Protocol::Https } else { Protocol::Http },
        remote_addr,
        raw_headers,
        is_h2,
        Body::new(body_bytes, content_type),
    );

    match engine.dispatch(&mut fingerprint).await {
        Ok(ExecutionOutcome::Response(resp)) => to_hyper_response(resp),
        Ok(ExecutionOutcome::Stream(stream)) => to_hyper_response(StepResponse {
            status: stream.status,
            headers: stream.headers,
            body: stream
                .chunks
                .iter()
                .flat_map(|c| c.data.to_vec())
                .collect::<Vec<u8>>()
                .into(),
        }),
        Ok(ExecutionOutcome::PassThrough(cfg)) => {
            match passthrough::forward(&mut fingerprint, &cfg, &engine.listener_addrs()).await {
                Ok(resp) => to_hyper_response(resp),
                Err(ProxyError::Abort(abort)) => abort_connection(abort_tx, abort.kind).await,
                Err(e) => {
                    fingerprint.tag(e.tag());
                    error_response(502, "Error communicating with upstream server".to_string())
                }
            }
        }
        Ok(
            ExecutionOutcome::WsPassThrough(_)
            | ExecutionOutcome::WsEcho(_)
            | ExecutionOutcome::WsListen(_)
            | ExecutionOutcome::WsReject(_),
        ) => error_response(400, "rule matched a WebSocket-only step for a plain HTTP request".to_string()),
        Err(ProxyError::Abort(abort)) => abort_connection(abort_tx, abort.kind).await,
        Err(e) => error_response(502, e.to_string()),
    }
}

/// Signals the owning connection task to tear down the raw socket for
/// `kind` (see [`serve_connection`]) and then never resolves, so hyper never
/// gets a response to write for this request: an abort ends the connection
/// with no response body at all, not a `499`.
async fn abort_connection(abort_tx: mpsc::Sender<AbortKind>, kind: AbortKind) -> Response<Full<Bytes>> {
    let _ = abort_tx.send(kind).await;
    std::future::pending::<Response<Full<Bytes>>>().await
}

/// A request is a WebSocket upgrade request iff it asks (HTTP/1.1, RFC
/// 6455) to switch protocols to `websocket`.
fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let has_token = |header: http::header::HeaderName, token: &str| {
        req.headers()
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    };
    req.method() == http::Method::GET
        && has_token(http::header::UPGRADE, "websocket")
        && has_token(http::header::CONNECTION, "upgrade")
}

async fn handle_websocket_upgrade(
    engine: Arc<Engine>,
    mut req: Request<Incoming>,
    remote_addr: SocketAddr,
    abort_tx: mpsc::Sender<AbortKind>,
) -> Response<Full<Bytes>> {
    let url = match absolute_url(req.uri()) {
        Ok(url) => url,
        Err(e) => return error_response(400, e),
    };
    let accept_key = match req
        .headers()
        .get("sec-websocket-key")
        .map(|v| tungstenite::handshake::derive_accept_key(v.as_bytes()))
    {
        Some(key) => key,
        None => return error_response(400, "missing Sec-WebSocket-Key header".to_string()),
    };
    let raw_headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect();
    let subprotocols = passthrough::websocket::filter_subprotocols(
        req.headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok()),
    );

    let mut fingerprint = RequestFingerprint::new(
        req.method().clone(),
        url.clone(),
        Protocol::Ws,
        remote_addr,
        raw_headers.clone(),
        false,
        Body::empty(),
    );

    let winner = match engine.dispatch(&mut fingerprint).await {
        Ok(outcome) => outcome,
        Err(ProxyError::Abort(abort)) => return abort_connection(abort_tx, abort.kind).await,
        Err(_) => return error_response(502, "failed to evaluate rules for websocket upgrade".into()),
    };

    let cfg = match winner {
        ExecutionOutcome::WsPassThrough(cfg) => cfg,
        ExecutionOutcome::PassThrough(_) => crate::step::WsPassThroughStep::default(),
        ExecutionOutcome::WsReject(reject) => {
            let mut builder = Response::builder().status(reject.status);
            for (name, value) in &reject.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            return builder
                .body(Full::new(reject.body))
                .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())));
        }
        ExecutionOutcome::WsEcho(_) => {
            return upgrade_and_serve(req, accept_key, |downstream| async move {
                if let Err(e) = passthrough::websocket::pipe_echo(downstream).await {
                    debug!(error = %e, "websocket echo ended with error");
                }
            });
        }
        ExecutionOutcome::WsListen(_) => {
            return upgrade_and_serve(req, accept_key, |downstream| async move {
                if let Err(e) = passthrough::websocket::pipe_listen(downstream).await {
                    debug!(error = %e, "websocket listen ended with error");
                }
            });
        }
        _ => return error_response(400, "matched rule has no WebSocket handling step".into()),
    };

    if cfg.simulate_connection_errors {
        fingerprint.tag("passthrough-error:ECONNRESET".to_string());
        engine.events().publish(crate::events::Event::ClientError(
            crate::events::ClientErrorEvent {
                request_id: None,
                message: "simulated websocket connection error".to_string(),
            },
        ));
        return error_response(502, "Error communicating with upstream server".to_string());
    }

    let target = match passthrough::target::resolve(&fingerprint) {
        Ok(target) => target,
        Err(e) => return error_response(502, e.to_string()),
    };
    if passthrough::target::would_loop(&target, &engine.listener_addrs()) {
        return error_response(500, "loop detected: request would forward back into this proxy".to_string());
    }

    // Connect upstream *before* answering the downstream handshake: a
    // non-101 upstream response has to be mirrored verbatim, which is only
    // possible if we haven't already committed to `101 Switching Protocols`.
    let tls_config = if target.scheme.eq_ignore_ascii_case("wss") {
        match crate::passthrough::tls::client_config_for_host(
            &cfg.ignore_host_https_errors,
            &[],
            &cfg.client_certificate_host_map,
            &target.host,
            target.port,
        ) {
            Ok(config) => Some(config),
            Err(e) => return error_response(502, e.to_string()),
        }
    } else {
        None
    };
    let forward_headers: Vec<(String, String)> = raw_headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("host"))
        .cloned()
        .collect();
    let connect_outcome = match passthrough::websocket::connect_upstream(
        &target.uri,
        &forward_headers,
        &subprotocols,
        tls_config,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            fingerprint.tag(e.tag());
            return error_response(502, "Error communicating with upstream server".to_string());
        }
    };

    let (upstream, negotiated_protocol) = match connect_outcome {
        passthrough::websocket::ConnectOutcome::Connected { stream, subprotocol } => (stream, subprotocol),
        passthrough::websocket::ConnectOutcome::Rejected { status, headers, body } => {
            let mut builder = Response::builder().status(status);
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            return builder
                .body(Full::new(body))
                .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())));
        }
    };

    engine.events().publish(crate::events::Event::PassthroughWebsocketConnect(
        crate::events::PassthroughWebsocketConnectEvent {
            request_id: uuid::Uuid::new_v4().to_string(),
            method: fingerprint.method.to_string(),
            protocol: url.scheme().to_string(),
            hostname: url.host_str().unwrap_or_default().to_string(),
            port: url.port_or_known_default().unwrap_or(80),
            path: url.path().to_string(),
            raw_headers,
            subprotocols,
        },
    ));

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!(error = %e, "websocket upgrade handshake failed");
                return;
            }
        };
        let downstream = tokio_tungstenite::WebSocketStream::from_raw_socket(
            TokioIo::new(upgraded),
            tungstenite::protocol::Role::Server,
            None,
        )
        .await;

        if let Err(e) = passthrough::websocket::pipe(downstream, upstream).await {
            debug!(error = %e, "websocket pipe ended with error");
        }
    });

    let mut builder = Response::builder()
        .status(101)
        .header(http::header::UPGRADE, "websocket")
        .header(http::header::CONNECTION, "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key);
    if let Some(protocol) = &negotiated_protocol {
        builder = builder.header("Sec-WebSocket-Protocol", protocol.as_str());
    }
    builder
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Completes the downstream upgrade handshake and hands the resulting
/// WebSocket stream to `handler` in a spawned task, for the `ws-echo` and
/// `ws-listen` steps that never talk to an upstream at all. Shares the
/// upgrade-then-wrap dance `handle_websocket_upgrade` uses for its own
/// pass-through path.
fn upgrade_and_serve<F, Fut>(
    mut req: Request<Incoming>,
    accept_key: String,
    handler: F,
) -> Response<Full<Bytes>>
where
    F: FnOnce(tokio_tungstenite::WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!(error = %e, "websocket upgrade handshake failed");
                return;
            }
        };
        let downstream = tokio_tungstenite::WebSocketStream::from_raw_socket(
            TokioIo::new(upgraded),
            tungstenite::protocol::Role::Server,
            None,
        )
        .await;
        handler(downstream).await;
    });

    Response::builder()
        .status(101)
        .header(http::header::UPGRADE, "websocket")
        .header(http::header::CONNECTION, "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn to_hyper_response(resp: StepResponse) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(resp.status);
    for (name, value) in &resp.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(resp.body))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn error_response(status: u16, message: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(message)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn absolute_url(parts: &http::request::Parts) -> std::result::Result<url::Url, String> {
    absolute_url_from(&parts.uri, &parts.headers)
}

fn absolute_url_from(
    uri: &http::Uri,
    headers: &http::HeaderMap,
) -> std::result::Result<url::Url, String> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return url::Url::parse(&uri.to_string()).map_err(|e| format!("invalid absolute URI: {e}"));
    }
    let host = headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "request carries no absolute URI and no Host header".to_string())?;
    let built = format!("http://{host}{}", uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"));
    url::Url::parse(&built).map_err(|e| format!("invalid reconstructed URL: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_url_from_host_header() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::HOST, "example.com".parse().unwrap());
        let uri: http::Uri = "/a/b?x=1".parse().unwrap();
        let url = absolute_url_from(&uri, &headers).unwrap();
        assert_eq!(url.as_str(), "http://example.com/a/b?x=1");
    }

    #[test]
    fn test_absolute_url_rejects_missing_host() {
        let headers = http::HeaderMap::new();
        let uri: http::Uri = "/a".parse().unwrap();
        assert!(absolute_url_from(&uri, &headers).is_err());
    }
}
