//! WebSocket pass-through: negotiate with the real upstream the same way the
//! original client asked, then pipe frames bidirectionally until either side
//! closes.
//!
//! Subprotocol negotiation and most headers are the upstream's to decide —
//! we forward the client's `Sec-WebSocket-Protocol` offer unchanged and
//! relay back whichever one (if any) the upstream picked, so a client
//! talking to the pass-through is none the wiser that it isn't hitting the
//! real server directly.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::{generate_key, Request};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use crate::error::{ProxyError, Result};

/// Headers the upstream handshake regenerates itself (`Host`,
/// `Connection`/`Upgrade`, and anything `Sec-WebSocket-*`) per spec §4.5:
/// "Strip Sec-WebSocket-*, Connection, Upgrade from forwarded headers (the
/// client library regenerates them)."
fn is_hop_by_hop_ws_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "host" || lower == "connection" || lower == "upgrade" || lower.starts_with("sec-websocket-")
}

/// What connecting to the upstream WebSocket endpoint produced.
pub enum ConnectOutcome {
    /// The upstream accepted the upgrade.
    Connected {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        subprotocol: Option<String>,
    },
    /// The upstream answered with something other than `101 Switching
    /// Protocols`; the caller should mirror this response downstream
    /// verbatim per spec §4.5 ("if upstream returns a non-101 response,
    /// mirror that rejection downstream").
    Rejected {
        status: http::StatusCode,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
}

/// Parses `Sec-WebSocket-Protocol`, drops empty entries, and returns the
/// filtered list to offer upstream.
pub fn filter_subprotocols(header_value: Option<&str>) -> Vec<String> {
    header_value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// A close code is valid per RFC 6455 if it's in 1000-1014 (excluding the
/// three reserved-for-local-use codes) or the private-use range 3000-4999.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1014 if !matches!(code, 1004 | 1005 | 1006)) || matches!(code, 3000..=4999)
}

/// tokio-tungstenite surfaces a client that sent an out-of-range close code
/// as a protocol error (`Invalid WebSocket frame: invalid status code
/// <n>`) rather than handing back the frame. To faithfully reproduce that
/// client's behavior on the upstream hop, re-derive the numeric code from
/// the error message and build the 2-byte big-endian close payload the
/// client actually tried to send.
pub fn faulty_close_frame_payload(error_message: &str) -> Option<[u8; 2]> {
    let digits: String = error_message
        .rsplit("invalid status code")
        .next()?
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let code: u16 = digits.parse().ok()?;
    Some(code.to_be_bytes())
}

/// Builds the upstream handshake request, forwarding every header from the
/// original request except the connection-specific ones tokio-tungstenite
/// sets for itself, offering `subprotocols` (already filtered of blanks)
/// explicitly rather than relying on whatever the client happened to send.
pub fn build_upstream_request(
    uri: &http::Uri,
    original_headers: &[(String, String)],
    subprotocols: &[String],
) -> std::result::Result<Request, tokio_tungstenite::tungstenite::Error> {
    let mut builder = Request::builder()
        .uri(uri.clone())
        .header("Sec-WebSocket-Key", generate_key())
        .header("Sec-WebSocket-Version", "13")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header(
            "Host",
            uri.authority().map(|a| a.as_str()).unwrap_or_default(),
        );

    for (name, value) in original_headers {
        if !is_hop_by_hop_ws_header(name) {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    if !subprotocols.is_empty() {
        builder = builder.header("Sec-WebSocket-Protocol", subprotocols.join(", "));
    }

    builder.body(())
}

/// Connects to the upstream WebSocket endpoint. `tls_config` is consulted
/// only for `wss` URIs (per the rule's `ignoreHostHttpsErrors`/client-cert
/// policy, the same as the HTTP pass-through path); it is ignored for
/// plaintext `ws`.
pub async fn connect_upstream(
    uri: &http::Uri,
    original_headers: &[(String, String)],
    subprotocols: &[String],
    tls_config: Option<Arc<rustls::ClientConfig>>,
) -> Result<ConnectOutcome> {
    let request = build_upstream_request(uri, original_headers, subprotocols)
        .map_err(|e| ProxyError::Validation(format!("invalid upstream websocket request: {e}")))?;

    let connector = tls_config.map(Connector::Rustls);
    match tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector).await {
        Ok((stream, response)) => {
            let protocol = response
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(ConnectOutcome::Connected {
                stream,
                subprotocol: protocol,
            })
        }
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            let status = response.status();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
                .collect();
            let body = response
                .body()
                .clone()
                .map(Bytes::from)
                .unwrap_or_default();
            Ok(ConnectOutcome::Rejected { status, headers, body })
        }
        Err(e) => Err(ProxyError::UpstreamError { code: e.to_string() }),
    }
}

/// Relays frames between the downstream client and the upstream server until
/// either side closes or errors. A close frame received from one side is
/// forwarded to the other before the pipe ends, so the original close code
/// and reason survive the hop (including upstream-sent faulty/malformed
/// close frames, which tungstenite surfaces as a protocol error rather than
/// a frame — those are classified the same as any other upstream error).
pub async fn pipe<D>(
    downstream: WebSocketStream<D>,
    upstream: WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<()>
where
    D: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut down_tx, mut down_rx) = downstream.split();
    let (mut up_tx, mut up_rx) = upstream.split();

    loop {
        tokio::select! {
            frame = down_rx.next() => {
                match frame {
                    Some(Ok(msg)) => {
                        let is_close = matches!(msg, Message::Close(_));
                        if up_tx.send(msg).await.is_err() {
                            break;
                        }
                        if is_close {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(ProxyError::UpstreamError { code: e.to_string() }),
                    None => break,
                }
            }
            frame = up_rx.next() => {
                match frame {
                    Some(Ok(msg)) => {
                        let is_close = matches!(msg, Message::Close(_));
                        if down_tx.send(msg).await.is_err() {
                            break;
                        }
                        if is_close {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(ProxyError::UpstreamError { code: e.to_string() }),
                    None => break,
                }
            }
        }
    }

    let _ = down_tx.close().await;
    let _ = up_tx.close().await;
    Ok(())
}

/// Drives a `ws-echo` step: bounces every downstream frame straight back,
/// preserving text/binary and mirroring a close frame once before the
/// socket shuts down. No upstream connection is ever made.
pub async fn pipe_echo<D>(stream: WebSocketStream<D>) -> Result<()>
where
    D: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut tx, mut rx) = stream.split();
    while let Some(frame) = rx.next().await {
        match frame {
            Ok(msg) => {
                let is_close = matches!(msg, Message::Close(_));
                if tx.send(msg).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = tx.close().await;
    Ok(())
}

/// Drives a `ws-listen` step: reads and discards downstream frames without
/// ever writing one back, until the client closes or errors.
pub async fn pipe_listen<D>(stream: WebSocketStream<D>) -> Result<()>
where
    D: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut tx, mut rx) = stream.split();
    loop {
        match rx.next().await {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        }
    }
    let _ = tx.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_upstream_request_strips_hop_by_hop_and_keeps_others() {
        let uri: http::Uri = "wss://example.com/socket".parse().unwrap();
        let headers = vec![
            ("Connection".to_string(), "Upgrade".to_string()),
            // A raw Sec-WebSocket-Protocol on the original request is
            // dropped; only the explicit `subprotocols` param controls what
            // gets offered upstream.
            ("Sec-WebSocket-Protocol".to_string(), "raw-passthrough".to_string()),
            ("Authorization".to_string(), "Bearer xyz".to_string()),
        ];
        let request = build_upstream_request(&uri, &headers, &["chat".to_string()]).unwrap();
        assert_eq!(
            request
                .headers()
                .get("sec-websocket-protocol")
                .unwrap()
                .to_str()
                .unwrap(),
            "chat"
        );
        assert_eq!(
            request.headers().get("authorization").unwrap().to_str().unwrap(),
            "Bearer xyz"
        );
    }

    #[test]
    fn test_build_upstream_request_omits_protocol_header_when_none_offered() {
        let uri: http::Uri = "ws://example.com/socket".parse().unwrap();
        let request = build_upstream_request(&uri, &[], &[]).unwrap();
        assert!(request.headers().get("sec-websocket-protocol").is_none());
    }

    #[test]
    fn test_filter_subprotocols_drops_empty() {
        assert_eq!(
            filter_subprotocols(Some("chat, , superchat")),
            vec!["chat".to_string(), "superchat".to_string()]
        );
        assert!(filter_subprotocols(None).is_empty());
    }

    #[test]
    fn test_valid_close_codes() {
        assert!(is_valid_close_code(1000));
        assert!(is_valid_close_code(1014));
        assert!(!is_valid_close_code(1005));
        assert!(is_valid_close_code(3000));
        assert!(is_valid_close_code(4999));
        assert!(!is_valid_close_code(5000));
    }

    #[test]
    fn test_faulty_close_frame_payload_extracts_code() {
        let payload =
            faulty_close_frame_payload("Invalid WebSocket frame: invalid status code 9999")
                .unwrap();
        assert_eq!(u16::from_be_bytes(payload), 9999);
    }

    #[test]
    fn test_faulty_close_frame_payload_none_for_other_errors() {
        assert!(faulty_close_frame_payload("connection reset by peer").is_none());
    }
}
