//! `Stream` step: deliver a canned sequence of body chunks, each with its own
//! optional delay. Unlike every other step, a `StreamStep` instance is
//! single-use: once its chunks have been handed to a request they're gone, so
//! that replaying the same stream for a second match doesn't silently resend
//! stale data. A rule that wants a stream to replay per match should wrap the
//! construction in its own factory rather than share one `StreamStep`.

use std::sync::Mutex;

use super::{StepContext, StepOutcome, StreamChunk, StreamingResponse};
use crate::error::{ProxyError, Result};

#[derive(Debug)]
pub struct StreamStep {
    status: u16,
    headers: Vec<(String, String)>,
    chunks: Mutex<Option<Vec<StreamChunk>>>,
}

impl StreamStep {
    pub fn new(status: u16, chunks: Vec<StreamChunk>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            chunks: Mutex::new(Some(chunks)),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub async fn run(&self, _ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        let chunks = self
            .chunks
            .lock()
            .expect("stream step mutex poisoned")
            .take()
            .ok_or(ProxyError::StreamReused)?;
        Ok(StepOutcome::RespondStream(StreamingResponse {
            status: self.status,
            headers: self.headers.clone(),
            chunks,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Protocol, RequestFingerprint};
    use bytes::Bytes;
    use http::Method;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use url::Url;

    fn ctx(req: &mut RequestFingerprint) -> StepContext<'_> {
        StepContext {
            request: req,
            rule_id: "rule-1",
            debug: false,
        }
    }

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
    async fn test_stream_step_delivers_chunks_once() {
        let step = StreamStep::new(
            200,
            vec![
                StreamChunk {
                    data: Bytes::from_static(b"a"),
                    delay_ms: None,
                },
                StreamChunk {
                    data: Bytes::from_static(b"b"),
                    delay_ms: Some(5),
                },
            ],
        );
        let mut r = req();
        match step.run(&mut ctx(&mut r)).await.unwrap() {
            StepOutcome::RespondStream(resp) => assert_eq!(resp.chunks.len(), 2),
            _ => panic!("expected RespondStream"),
        }

        let mut r2 = req();
        let err = step.run(&mut ctx(&mut r2)).await.unwrap_err();
        assert!(matches!(err, ProxyError::StreamReused));
    }
}
