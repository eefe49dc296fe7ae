//! Lazily-decoded request/response body.
//!
//! A `Body` is built once from the raw bytes read off the wire and then handed
//! around to matchers, steps, and the recorded-request snapshot. Decoding into
//! text, JSON, or form fields is deferred until something actually asks for it,
//! and the result is cached so a rule with several body matchers doesn't re-parse
//! the same bytes per matcher.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::Bytes;
use serde_json::Value;

use crate::error::{ProxyError, Result};

/// A single part of a `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Default)]
struct Decoded {
    text: OnceLock<Result<String>>,
    json: OnceLock<Result<Value>>,
    form: OnceLock<Result<Vec<(String, String)>>>,
    multipart: OnceLock<Result<Vec<MultipartPart>>>,
}

impl std::fmt::Debug for Decoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoded").finish_non_exhaustive()
    }
}

/// Raw body bytes plus memoized, on-demand decodes.
///
/// Cloning a `Body` is cheap: the raw bytes are reference-counted and the decode
/// caches start empty again in the clone, since `OnceLock` itself isn't `Clone`.
#[derive(Debug, Clone)]
pub struct Body {
    raw: Bytes,
    content_type: Option<String>,
    decoded: std::sync::Arc<Decoded>,
}

impl Body {
    pub fn new(raw: impl Into<Bytes>, content_type: Option<String>) -> Self {
        Self {
            raw: raw.into(),
            content_type,
            decoded: std::sync::Arc::new(Decoded::default()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Bytes::new(), None)
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Decodes the body as UTF-8 text. Cached after the first call.
    pub fn as_text(&self) -> Result<&str> {
        self.decoded
            .text
            .get_or_init(|| {
                String::from_utf8(self.raw.to_vec())
                    .map_err(|e| ProxyError::DecodeError(format!("body is not valid UTF-8: {e}")))
            })
            .as_deref()
            .map_err(clone_err)
    }

    /// Parses the body as JSON. Cached after the first call.
    pub fn as_json(&self) -> Result<&Value> {
        self.decoded
            .json
            .get_or_init(|| {
                serde_json::from_slice(&self.raw)
                    .map_err(|e| ProxyError::DecodeError(format!("body is not valid JSON: {e}")))
            })
            .as_ref()
            .map_err(clone_err)
    }

    /// Parses the body as `application/x-www-form-urlencoded`. Cached after the
    /// first call. Preserves duplicate keys and wire order.
    pub fn as_form(&self) -> Result<&[(String, String)]> {
        self.decoded
            .form
            .get_or_init(|| {
                Ok(form_urlencoded::parse(&self.raw)
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect())
            })
            .as_deref()
            .map_err(clone_err)
    }

    /// Parses the body as `multipart/form-data` using this body's own content type
    /// for the boundary, or an explicitly supplied one if the caller already
    /// extracted it from a header elsewhere. Cached after the first call only
    /// when using the body's own content type.
    pub fn as_multipart(&self) -> Result<&[MultipartPart]> {
        self.decoded
            .multipart
            .get_or_init(|| {
                let content_type = self.content_type.as_deref().ok_or_else(|| {
                    ProxyError::DecodeError("multipart body has no Content-Type".into())
                })?;
                let boundary = boundary_from_content_type(content_type).ok_or_else(|| {
                    ProxyError::DecodeError("multipart Content-Type has no boundary".into())
                })?;
                parse_multipart(&self.raw, &boundary)
            })
            .as_deref()
            .map_err(clone_err)
    }

    /// Convenience: form field lookup by key (first match).
    pub fn form_field(&self, key: &str) -> Result<Option<&str>> {
        Ok(self
            .as_form()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str()))
    }
}

fn clone_err(e: &ProxyError) -> ProxyError {
    ProxyError::DecodeError(e.to_string())
}

fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
}

fn parse_multipart(raw: &[u8], boundary: &str) -> Result<Vec<MultipartPart>> {
    let delimiter = format!("--{boundary}");
    let text_boundary = delimiter.as_bytes();
    let mut parts = Vec::new();

    let segments = split_on(raw, text_boundary);
    for segment in segments {
        let segment = trim_crlf(segment);
        if segment.is_empty() || segment == b"--" {
            continue;
        }
        let segment = segment.strip_prefix(b"\r\n").unwrap_or(segment);
        let Some(header_end) = find_double_crlf(segment) else {
            continue;
        };
        let header_block = &segment[..header_end];
        let body = &segment[header_end + 4..];
        let body = trim_trailing_crlf(body);

        let headers = String::from_utf8_lossy(header_block);
        let mut name = None;
        let mut file_name = None;
        let mut content_type = None;
        for line in headers.split("\r\n") {
            if let Some(value) = line.strip_prefix("Content-Disposition:") {
                for token in value.split(';').map(str::trim) {
                    if let Some(n) = token.strip_prefix("name=") {
                        name = Some(n.trim_matches('"').to_string());
                    } else if let Some(f) = token.strip_prefix("filename=") {
                        file_name = Some(f.trim_matches('"').to_string());
                    }
                }
            } else if let Some(value) = line.strip_prefix("Content-Type:") {
                content_type = Some(value.trim().to_string());
            }
        }

        let Some(name) = name else { continue };
        parts.push(MultipartPart {
            name,
            file_name,
            content_type,
            data: Bytes::copy_from_slice(body),
        });
    }

    Ok(parts)
}

fn split_on<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut rest = haystack;
    while let Some(pos) = find_subslice(rest, needle) {
        out.push(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    out.push(rest);
    // first segment is the preamble before the first boundary; drop it.
    if !out.is_empty() {
        out.remove(0);
    }
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_double_crlf(data: &[u8]) -> Option<usize> {
    find_subslice(data, b"\r\n\r\n")
}

fn trim_crlf(data: &[u8]) -> &[u8] {
    data.strip_prefix(b"\r\n").unwrap_or(data)
}

fn trim_trailing_crlf(data: &[u8]) -> &[u8] {
    data.strip_suffix(b"\r\n").unwrap_or(data)
}

/// Flattened multi-map view, used by the `FormData` matcher.
pub fn form_to_map(pairs: &[(String, String)]) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (k, v) in pairs {
        map.entry(k.clone()).or_default().push(v.clone());
    }
    map
}
