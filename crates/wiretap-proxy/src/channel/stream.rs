//! Wire protocol for a `Stream` step's body when the chunks themselves are
//! supplied by a remote admin client rather than baked into the rule at
//! registration time.
//!
//! Framed messages alternate `data` (one chunk) and a final `end`; each
//! `data` message's `content` tags its payload's original JS-ish shape
//! (`string`/`buffer`/`arraybuffer`/`nil`) so the admin client can
//! reconstruct the exact type it handed the engine, the same round-trip
//! guarantee [`crate::channel::body::WireBody`] gives whole bodies.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::step::StreamChunk;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamContent {
    String { value: String },
    Buffer { value: String },
    Arraybuffer { value: String },
    Nil,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamMessage {
    Data { content: StreamContent, delay_ms: Option<u64> },
    /// Sent once by the engine after the downstream socket is ready to
    /// receive the stream, signalling the remote admin client to begin
    /// forwarding its queued chunks.
    Ping,
    End,
}

impl StreamContent {
    pub fn from_bytes(bytes: &Bytes) -> Self {
        if bytes.is_empty() {
            return StreamContent::Nil;
        }
        match std::str::from_utf8(bytes) {
            Ok(text) => StreamContent::String {
                value: text.to_string(),
            },
            Err(_) => StreamContent::Buffer {
                value: BASE64.encode(bytes),
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            StreamContent::String { value } => Ok(Bytes::from(value.clone().into_bytes())),
            StreamContent::Buffer { value } | StreamContent::Arraybuffer { value } => BASE64
                .decode(value)
                .map(Bytes::from)
                .map_err(|e| ProxyError::DecodeError(format!("invalid base64 stream chunk: {e}"))),
            StreamContent::Nil => Ok(Bytes::new()),
        }
    }
}

/// Encodes every chunk of a rule's stream as a `data` message sequence
/// terminated by `end`, for sending over the admin channel to a remote
/// consumer (e.g. an introspection client watching a stream unfold).
pub fn encode_chunks(chunks: &[StreamChunk]) -> Vec<StreamMessage> {
    let mut messages: Vec<StreamMessage> = chunks
        .iter()
        .map(|chunk| StreamMessage::Data {
            content: StreamContent::from_bytes(&chunk.data),
            delay_ms: chunk.delay_ms,
        })
        .collect();
    messages.push(StreamMessage::End);
    messages
}

/// Decodes a `data`/`end` message sequence (as sent by a remote admin
/// client supplying a rule's stream body) back into `StreamChunk`s, stopping
/// at the first `end`/`ping` message.
pub fn decode_chunks(messages: &[StreamMessage]) -> Result<Vec<StreamChunk>> {
    let mut chunks = Vec::new();
    for message in messages {
        match message {
            StreamMessage::Data { content, delay_ms } => chunks.push(StreamChunk {
                data: content.to_bytes()?,
                delay_ms: *delay_ms,
            }),
            StreamMessage::End => break,
            StreamMessage::Ping => continue,
        }
    }
    Ok(chunks)
}
