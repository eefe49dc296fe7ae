//! `File` step: serve the contents of a file on disk as the response body.
//!
//! The file is read fresh on every match (not cached at rule construction
//! time) so a rule can be used to serve a fixture that changes between test
//! runs without restarting the engine.

use super::{StepContext, StepOutcome, StepResponse};
use crate::error::{ProxyError, Result};

#[derive(Debug, Clone)]
pub struct FileStep {
    pub status: u16,
    pub path: std::path::PathBuf,
    pub content_type: Option<String>,
}

impl FileStep {
    pub fn new(status: u16, path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            status,
            path: path.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub async fn run(&self, _ctx: &mut StepContext<'_>) -> Result<StepOutcome> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            ProxyError::DecodeError(format!("failed to read file {}: {e}", self.path.display()))
        })?;
        let mut resp = StepResponse::new(self.status).with_body(bytes);
        if let Some(content_type) = &self.content_type {
            resp = resp.with_header("content-type", content_type.clone());
        } else if let Some(guessed) = guess_content_type(&self.path) {
            resp = resp.with_header("content-type", guessed);
        }
        Ok(StepOutcome::Respond(resp))
    }
}

fn guess_content_type(path: &std::path::Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "json" => Some("application/json"),
        "html" | "htm" => Some("text/html"),
        "txt" => Some("text/plain"),
        "xml" => Some("application/xml"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, Protocol, RequestFingerprint};
    use http::Method;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use url::Url;

    #[tokio::test]
    async fn test_file_step_reads_contents_and_guesses_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.json");
        tokio::fs::write(&path, br#"{"a":1}"#).await.unwrap();

        let step = FileStep::new(200, &path);
        let mut req = RequestFingerprint::new(
            Method::GET,
            Url::parse("http://x/a").unwrap(),
            Protocol::Http,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1),
            vec![],
            false,
            Body::empty(),
        );
        let mut ctx = StepContext {
            request: &mut req,
            rule_id: "rule-1",
            debug: false,
        };
        match step.run(&mut ctx).await.unwrap() {
            StepOutcome::Respond(resp) => {
                assert_eq!(resp.body.as_ref(), br#"{"a":1}"#);
                assert!(resp
                    .headers
                    .iter()
                    .any(|(k, v)| k == "content-type" && v == "application/json"));
            }
            _ => panic!("expected Respond"),
        }
    }

    #[tokio::test]
    async fn test_file_step_missing_file_errors() {
        let step = FileStep::new(200, "/nonexistent/path/does-not-exist.json");
        let mut req = RequestFingerprint::new(
            Method::GET,
            Url::parse("http://x/a").unwrap(),
            Protocol::Http,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1),
            vec![],
            false,
            Body::empty(),
        );
        let mut ctx = StepContext {
            request: &mut req,
            rule_id: "rule-1",
            debug: false,
        };
        assert!(step.run(&mut ctx).await.is_err());
    }
}
