//! Declarative request/response transforms for the `PassThrough` step.
//!
//! A rule configures at most one of a declarative [`TransformRequest`] or a
//! [`BeforeRequestCallback`] (never both — enforced by
//! [`PassThroughStep`](crate::step::PassThroughStep) construction), and
//! likewise for the response side. This module only implements the
//! declarative half; the callback half lives alongside it as a trait so the
//! pass-through `forward` loop can treat both uniformly.

use std::path::PathBuf;

use bytes::Bytes;
use serde_json::Value;

use crate::error::{ProxyError, Result};
use crate::request::{Protocol, RequestFingerprint};
use crate::step::StepResponse;

/// One `replace`/`move`/`copy`/`test`/`add`/`remove` operation from RFC 6902,
/// validated upfront at construction time (spec §4.4 step 3: "JSON-patch
/// operations are validated upfront").
#[derive(Debug, Clone)]
pub struct JsonPatchOp {
    pub op: JsonPatchOpKind,
    pub path: String,
    pub value: Option<Value>,
    pub from: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonPatchOpKind {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

impl JsonPatchOp {
    fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') && !self.path.is_empty() {
            return Err(ProxyError::Validation(format!(
                "json-patch path must be empty or start with '/': {}",
                self.path
            )));
        }
        match self.op {
            JsonPatchOpKind::Add | JsonPatchOpKind::Replace | JsonPatchOpKind::Test => {
                if self.value.is_none() {
                    return Err(ProxyError::Validation(format!(
                        "json-patch {:?} at {} requires a value",
                        self.op, self.path
                    )));
                }
            }
            JsonPatchOpKind::Move | JsonPatchOpKind::Copy => {
                if self.from.is_none() {
                    return Err(ProxyError::Validation(format!(
                        "json-patch {:?} at {} requires a from pointer",
                        self.op, self.path
                    )));
                }
            }
            JsonPatchOpKind::Remove => {}
        }
        Ok(())
    }
}

/// A regex-pattern-and-replacement pair, used by `matchReplaceHost`,
/// `matchReplacePath`, `matchReplaceQuery`, and `matchReplaceBody`. Compiled
/// once at rule-construction time so a bad pattern is rejected before any
/// request ever reaches it.
#[derive(Clone)]
pub struct MatchReplace {
    pub pattern: regex::Regex,
    pub replacement: String,
}

impl std::fmt::Debug for MatchReplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchReplace")
            .field("pattern", &self.pattern.as_str())
            .field("replacement", &self.replacement)
            .finish()
    }
}

impl MatchReplace {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            pattern: regex::Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    fn apply(&self, input: &str) -> String {
        self.pattern.replace_all(input, self.replacement.as_str()).into_owned()
    }
}

/// Which body-rewrite to apply; mutually exclusive (spec §4.4 step 3).
#[derive(Debug, Clone)]
pub enum BodyTransform {
    Replace(Bytes),
    ReplaceFromFile(PathBuf),
    /// Merge these keys into the parsed JSON body; a `Value::Null` entry
    /// deletes the corresponding key (spec: "`updateJsonBody` with
    /// `undefined` values deletes keys").
    UpdateJson(Value),
    PatchJson(Vec<JsonPatchOp>),
    MatchReplace(Vec<MatchReplace>),
}

/// Which host-rewrite to apply; mutually exclusive.
#[derive(Debug, Clone)]
pub enum HostTransform {
    Replace { host: String, port: Option<u16> },
    MatchReplace(Vec<MatchReplace>),
}

/// Which header-rewrite to apply; mutually exclusive.
#[derive(Debug, Clone)]
pub enum HeaderTransform {
    /// Case-insensitive merge on top of the original headers, preserving the
    /// casing of every key the transform didn't touch (P7: "a
    /// `transformRequest` with only `updateHeaders` preserves raw header
    /// casing of unchanged keys").
    Update(Vec<(String, String)>),
    /// Discards every original header and forwards only these (P7: "with
    /// `replaceHeaders` discards all original request headers").
    Replace(Vec<(String, String)>),
}

/// How the `Host`/`:authority` header should be updated when the host
/// changes, mirroring spec §4.4 step 1's `updateHostHeader` tri-state.
#[derive(Debug, Clone, Default)]
pub enum UpdateHostHeader {
    #[default]
    Auto,
    Never,
    Custom(String),
}

/// Declarative request transform. At most one variant of each mutually
/// exclusive group may be set; [`TransformRequest::validate`] enforces this.
#[derive(Debug, Clone, Default)]
pub struct TransformRequest {
    pub replace_method: Option<http::Method>,
    pub headers: Option<HeaderTransform>,
    pub body: Option<BodyTransform>,
    pub host: Option<HostTransform>,
    pub match_replace_path: Option<Vec<MatchReplace>>,
    pub match_replace_query: Option<Vec<MatchReplace>>,
    pub set_protocol: Option<Protocol>,
    pub update_host_header: UpdateHostHeader,
}

impl TransformRequest {
    pub fn validate(&self) -> Result<()> {
        if let Some(BodyTransform::PatchJson(ops)) = &self.body {
            for op in ops {
                op.validate()?;
            }
        }
        Ok(())
    }

    /// Mutates `req` in place per spec §4.4 step 3 and §4.4 step 1 (host
    /// rewriting + Host header policy).
    pub fn apply(&self, req: &mut RequestFingerprint) -> Result<()> {
        self.validate()?;

        if let Some(method) = &self.replace_method {
            req.method = method.clone();
        }

        if let Some(protocol) = self.set_protocol {
            let _ = req.url.set_scheme(match protocol {
                Protocol::Http | Protocol::Ws => "http",
                Protocol::Https | Protocol::Wss => "https",
            });
        }

        let mut host_changed = false;
        if let Some(host_transform) = &self.host {
            match host_transform {
                HostTransform::Replace { host, port } => {
                    req.url
                        .set_host(Some(host))
                        .map_err(|e| ProxyError::Validation(format!("invalid replacement host: {e}")))?;
                    if let Some(port) = port {
                        let _ = req.url.set_port(Some(*port));
                    }
                    host_changed = true;
                }
                HostTransform::MatchReplace(rules) => {
                    if let Some(host) = req.url.host_str() {
                        let mut rewritten = host.to_string();
                        for rule in rules {
                            rewritten = rule.apply(&rewritten);
                        }
                        if rewritten != host {
                            req.url
                                .set_host(Some(&rewritten))
                                .map_err(|e| ProxyError::Validation(format!("invalid replacement host: {e}")))?;
                            host_changed = true;
                        }
                    }
                }
            }
        }

        if let Some(rules) = &self.match_replace_path {
            let mut path = req.url.path().to_string();
            for rule in rules {
                path = rule.apply(&path);
            }
            req.url.set_path(&path);
        }

        if let Some(rules) = &self.match_replace_query {
            let original = req.url.query().unwrap_or("").to_string();
            let mut query = original;
            for rule in rules {
                query = rule.apply(&query);
            }
            if query.is_empty() {
                req.url.set_query(None);
            } else {
                req.url.set_query(Some(&query));
            }
        }

        if host_changed {
            apply_host_header(req, &self.update_host_header);
        }

        if let Some(header_transform) = &self.headers {
            apply_header_transform(&mut req.raw_headers, header_transform);
        }

        if let Some(body_transform) = &self.body {
            let new_body = apply_body_transform_bytes(req.body.raw().clone(), req.body.content_type(), body_transform)?;
            recompute_content_length(&mut req.raw_headers, new_body.len());
            req.body = crate::request::Body::new(new_body, req.body.content_type().map(str::to_string));
        }

        Ok(())
    }
}

/// Declarative response transform; same shape minus the request-only fields
/// (method, host, path/query, protocol).
#[derive(Debug, Clone, Default)]
pub struct TransformResponse {
    pub replace_status: Option<u16>,
    pub headers: Option<HeaderTransform>,
    pub body: Option<BodyTransform>,
}

impl TransformResponse {
    pub fn validate(&self) -> Result<()> {
        if let Some(BodyTransform::PatchJson(ops)) = &self.body {
            for op in ops {
                op.validate()?;
            }
        }
        Ok(())
    }

    pub fn apply(&self, resp: &mut StepResponse) -> Result<()> {
        self.validate()?;

        if let Some(status) = self.replace_status {
            resp.status = status;
        }

        if let Some(header_transform) = &self.headers {
            apply_header_transform(&mut resp.headers, header_transform);
        }

        if let Some(body_transform) = &self.body {
            let content_type = resp
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .map(|(_, v)| v.clone());
            let new_body = apply_body_transform_bytes(resp.body.clone(), content_type.as_deref(), body_transform)?;
            recompute_content_length(&mut resp.headers, new_body.len());
            resp.body = new_body;
        }

        Ok(())
    }
}

fn apply_host_header(req: &mut RequestFingerprint, policy: &UpdateHostHeader) {
    let authority = req.host_with_explicit_port().unwrap_or_default();
    match policy {
        UpdateHostHeader::Never => {}
        UpdateHostHeader::Auto => set_header(&mut req.raw_headers, "host", &authority),
        UpdateHostHeader::Custom(value) => set_header(&mut req.raw_headers, "host", value),
    }
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    if let Some(entry) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        entry.1 = value.to_string();
    } else {
        headers.push((name.to_string(), value.to_string()));
    }
}

/// `updateHeaders` merges case-insensitively while leaving every other
/// header's original casing untouched; `replaceHeaders` throws away the
/// original list outright (P7).
fn apply_header_transform(headers: &mut Vec<(String, String)>, transform: &HeaderTransform) {
    match transform {
        HeaderTransform::Update(updates) => {
            for (name, value) in updates {
                set_header(headers, name, value);
            }
        }
        HeaderTransform::Replace(replacement) => {
            *headers = replacement.clone();
        }
    }
}

fn recompute_content_length(headers: &mut Vec<(String, String)>, len: usize) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
    headers.push(("content-length".to_string(), len.to_string()));
}

fn apply_body_transform_bytes(
    original: Bytes,
    content_type: Option<&str>,
    transform: &BodyTransform,
) -> Result<Bytes> {
    match transform {
        BodyTransform::Replace(bytes) => Ok(bytes.clone()),
        BodyTransform::ReplaceFromFile(path) => std::fs::read(path)
            .map(Bytes::from)
            .map_err(|e| ProxyError::Validation(format!("could not read replacement body file {path:?}: {e}"))),
        BodyTransform::UpdateJson(patch) => {
            let mut value: Value = serde_json::from_slice(&original)
                .map_err(|e| ProxyError::Validation(format!("body is not valid JSON: {e}")))?;
            merge_json(&mut value, patch);
            serde_json::to_vec(&value)
                .map(Bytes::from)
                .map_err(|e| ProxyError::Validation(e.to_string()))
        }
        BodyTransform::PatchJson(ops) => {
            let mut value: Value = serde_json::from_slice(&original)
                .map_err(|e| ProxyError::Validation(format!("body is not valid JSON: {e}")))?;
            for op in ops {
                apply_json_patch_op(&mut value, op)?;
            }
            serde_json::to_vec(&value)
                .map(Bytes::from)
                .map_err(|e| ProxyError::Validation(e.to_string()))
        }
        BodyTransform::MatchReplace(rules) => {
            let text = String::from_utf8(original.to_vec())
                .map_err(|e| ProxyError::Validation(format!("body is not valid UTF-8: {e}")))?;
            let mut rewritten = text;
            for rule in rules {
                rewritten = rule.apply(&rewritten);
            }
            Ok(Bytes::from(rewritten.into_bytes()))
        }
    }
    .map(|bytes| maybe_recompress(bytes, content_type))
}

/// Body transforms re-encode to the original `Content-Encoding`; this engine
/// never applies compression of its own (requests reach it pre-decoded by the
/// adapter layer), so there is nothing to redo here — documented so a future
/// contributor who adds on-the-wire compression support knows where to hook in.
fn maybe_recompress(bytes: Bytes, _content_type: Option<&str>) -> Bytes {
    bytes
}

/// `updateJsonBody` with `undefined`/`null` values deletes keys; everything
/// else is deep-merged into the original object (objects recurse, everything
/// else overwrites).
fn merge_json(original: &mut Value, patch: &Value) {
    match (original, patch) {
        (Value::Object(orig_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    orig_map.remove(key);
                } else {
                    merge_json(orig_map.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (slot, value) => {
            *slot = value.clone();
        }
    }
}

fn apply_json_patch_op(root: &mut Value, op: &JsonPatchOp) -> Result<()> {
    op.validate()?;
    match op.op {
        JsonPatchOpKind::Add | JsonPatchOpKind::Replace => {
            set_pointer(root, &op.path, op.value.clone().expect("validated"))?;
        }
        JsonPatchOpKind::Remove => {
            remove_pointer(root, &op.path)?;
        }
        JsonPatchOpKind::Test => {
            let expected = op.value.as_ref().expect("validated");
            let actual = root.pointer(&op.path);
            if actual != Some(expected) {
                return Err(ProxyError::Validation(format!(
                    "json-patch test failed at {}",
                    op.path
                )));
            }
        }
        JsonPatchOpKind::Move => {
            let from = op.from.as_ref().expect("validated");
            let value = root
                .pointer(from)
                .cloned()
                .ok_or_else(|| ProxyError::Validation(format!("json-patch move: no value at {from}")))?;
            remove_pointer(root, from)?;
            set_pointer(root, &op.path, value)?;
        }
        JsonPatchOpKind::Copy => {
            let from = op.from.as_ref().expect("validated");
            let value = root
                .pointer(from)
                .cloned()
                .ok_or_else(|| ProxyError::Validation(format!("json-patch copy: no value at {from}")))?;
            set_pointer(root, &op.path, value)?;
        }
    }
    Ok(())
}

fn set_pointer(root: &mut Value, pointer: &str, value: Value) -> Result<()> {
    if pointer.is_empty() {
        *root = value;
        return Ok(());
    }
    let (parent_pointer, key) = split_pointer(pointer);
    let parent = root
        .pointer_mut(&parent_pointer)
        .ok_or_else(|| ProxyError::Validation(format!("json-patch: no parent at {parent_pointer}")))?;
    match parent {
        Value::Object(map) => {
            map.insert(key, value);
        }
        Value::Array(arr) => {
            if key == "-" {
                arr.push(value);
            } else {
                let index: usize = key
                    .parse()
                    .map_err(|_| ProxyError::Validation(format!("json-patch: invalid array index {key}")))?;
                if index > arr.len() {
                    return Err(ProxyError::Validation(format!("json-patch: array index {index} out of bounds")));
                }
                arr.insert(index, value);
            }
        }
        _ => return Err(ProxyError::Validation(format!("json-patch: {parent_pointer} is not a container"))),
    }
    Ok(())
}

fn remove_pointer(root: &mut Value, pointer: &str) -> Result<()> {
    let (parent_pointer, key) = split_pointer(pointer);
    let parent = root
        .pointer_mut(&parent_pointer)
        .ok_or_else(|| ProxyError::Validation(format!("json-patch: no parent at {parent_pointer}")))?;
    match parent {
        Value::Object(map) => {
            map.remove(&key)
                .map(|_| ())
                .ok_or_else(|| ProxyError::Validation(format!("json-patch: no key {key} to remove")))
        }
        Value::Array(arr) => {
            let index: usize = key
                .parse()
                .map_err(|_| ProxyError::Validation(format!("json-patch: invalid array index {key}")))?;
            if index >= arr.len() {
                return Err(ProxyError::Validation(format!("json-patch: array index {index} out of bounds")));
            }
            arr.remove(index);
            Ok(())
        }
        _ => Err(ProxyError::Validation(format!("json-patch: {parent_pointer} is not a container"))),
    }
}

fn split_pointer(pointer: &str) -> (String, String) {
    let idx = pointer.rfind('/').unwrap_or(0);
    let (parent, key) = pointer.split_at(idx);
    let key = key.strip_prefix('/').unwrap_or(key);
    (parent.to_string(), unescape_pointer_token(key))
}

fn unescape_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}
