//! Body encoding for the wire protocol.
//!
//! Bodies cross the admin channel as base64, alongside a best-effort decoded
//! UTF-8 form for JSON payloads that are easier to eyeball or diff in a test
//! assertion than a base64 blob. A body a matcher/step chooses not to send at
//! all (e.g. a huge streamed upload a remote callback has no use for) is
//! represented by [`OMIT_SENTINEL`] rather than an empty string, so "empty
//! body" and "body withheld" stay distinguishable on the wire.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Marks a body field as intentionally withheld rather than empty.
pub const OMIT_SENTINEL: &str = "__wiretap_body_omitted__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireBody {
    pub encoded: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "decodingError")]
    pub decoding_error: Option<String>,
}

impl WireBody {
    pub fn from_bytes(bytes: &Bytes) -> Self {
        let decoded = std::str::from_utf8(bytes).ok().map(str::to_string);
        let decoding_error = if decoded.is_none() && !bytes.is_empty() {
            Some("body is not valid UTF-8".to_string())
        } else {
            None
        };
        Self {
            encoded: BASE64.encode(bytes),
            decoded,
            decoding_error,
        }
    }

    pub fn omitted() -> Self {
        Self {
            encoded: OMIT_SENTINEL.to_string(),
            decoded: None,
            decoding_error: None,
        }
    }

    pub fn is_omitted(&self) -> bool {
        self.encoded == OMIT_SENTINEL
    }

    pub fn to_bytes(&self) -> Result<Bytes, base64::DecodeError> {
        if self.is_omitted() {
            return Ok(Bytes::new());
        }
        BASE64.decode(&self.encoded).map(Bytes::from)
    }
}
